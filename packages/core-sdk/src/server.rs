use std::convert::Infallible;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::Query,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::{
    llm::{self, Resolved},
    models::ChatRequest,
    telemetry,
};

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与聊天 API。
 * \param addr   监听地址，如 "127.0.0.1:3000"
 * \param ui_dir 静态前端目录；缺省时读 RELAYCHAT_UI_DIR，再退回 "web"
 */
pub async fn run(addr: &str, ui_dir: Option<&str>) -> Result<()> {
    let ui_root = match ui_dir {
        Some(dir) => dir.to_string(),
        None => std::env::var("RELAYCHAT_UI_DIR").unwrap_or_else(|_| "web".to_string()),
    };

    let static_service =
        get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    let app = router().fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router() -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/models", get(models))
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    /** \brief Provider 名称（可选，未知名称回退 google） */
    provider: Option<String>,
}

/**
 * \brief 聊天流式接口：POST /api/chat，请求体为完整历史加配置覆盖。
 *
 * 请求体按原始字节手工解析，任何畸形 JSON 都让整个请求以 500 失败。
 */
async fn chat(
    body: Bytes,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (axum::http::StatusCode, String),
> {
    let req: ChatRequest = serde_json::from_slice(&body).map_err(internal_err)?;

    let resolved = Resolved::from_request(
        req.provider.as_deref(),
        req.model.as_deref(),
        req.api_key.as_deref(),
    );
    let instructions = req
        .instructions
        .unwrap_or_else(|| llm::DEFAULT_INSTRUCTIONS.to_string());
    let messages = req.messages;

    telemetry::log_event(
        "server.chat",
        &format!(
            "provider={} model={} msgs={}",
            resolved.kind.name(),
            resolved.model,
            messages.len()
        ),
    );

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();

    tokio::spawn(async move {
        match llm::stream_chat(&resolved, &instructions, &messages).await {
            Ok(mut s) => {
                use futures_util::StreamExt;
                while let Some(item) = s.as_mut().next().await {
                    match item {
                        Ok(delta) => {
                            let _ = tx.send(Ok(Event::default().data(delta)));
                        }
                        Err(e) => {
                            telemetry::log_error("server.chat", &format!("stream error: {}", e));
                            let _ = tx
                                .send(Ok(Event::default().event("error").data(format!("{}", e))));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                telemetry::log_error("server.chat", &format!("stream failed: {}", e));
                let _ = tx.send(Ok(Event::default().event("error").data(format!("{}", e))));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

/**
 * \brief 固定模型表查询：GET /api/models?provider=NAME。
 */
async fn models(Query(q): Query<ModelQuery>) -> Json<serde_json::Value> {
    let kind = llm::ProviderKind::from_name(q.provider.as_deref().unwrap_or(""));
    Json(serde_json::json!({
        "provider": kind.name(),
        "default": kind.default_model(),
        "models": kind.known_models(),
    }))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
