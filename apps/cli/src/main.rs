use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use relaychat_core_sdk::{client::ChatClient, server, session::Session, telemetry};

/**
 * \brief CLI 程序入口：本地服务与交互式聊天前端。
 */
#[derive(Parser, Debug)]
#[command(name = "relaychat", version, about = "RelayChat streaming chat front-end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
        /** \brief 静态前端目录，覆盖 RELAYCHAT_UI_DIR */
        #[arg(long)]
        ui_dir: Option<String>,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /**
     * \brief 连接服务端聊天；默认进入交互循环，--prompt 则单次发送。
     */
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        instructions: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_from_env();

    match cli.command {
        Commands::Serve {
            addr,
            ui_dir,
            enable_telemetry,
        } => {
            if enable_telemetry {
                telemetry::set_enabled(true);
            }
            server::run(&addr, ui_dir.as_deref()).await?;
        }
        Commands::Chat {
            server,
            provider,
            api_key,
            model,
            instructions,
            prompt,
            enable_telemetry,
        } => {
            if enable_telemetry {
                telemetry::set_enabled(true);
            }
            run_chat(server, provider, api_key, model, instructions, prompt).await?;
        }
    }

    Ok(())
}

async fn run_chat(
    server: String,
    provider: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    instructions: Option<String>,
    prompt: Option<String>,
) -> Result<()> {
    let mut session = Session::new();
    // provider 先于 model：切换 Provider 会把模型重置为其默认值
    if let Some(p) = provider.as_deref() {
        session.set_provider(p);
    }
    if let Some(m) = model.as_deref() {
        session.set_model(m);
    }
    if let Some(k) = api_key.as_deref() {
        session.set_api_key(k);
    }
    if let Some(i) = instructions.as_deref() {
        session.set_instructions(i);
    }

    let client = ChatClient::new(server);

    if let Some(text) = prompt {
        session.set_input(&text);
        send_turn(&client, &mut session).await;
        return Ok(());
    }

    println!(
        "Connected as provider={} model={}",
        session.provider().name(),
        session.model()
    );
    println!("Commands: /provider NAME, /model NAME, /key KEY, /instructions TEXT, /quit");

    loop {
        print_prompt();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\n', '\r']);

        if let Some(rest) = line.strip_prefix('/') {
            let (cmd, arg) = match rest.split_once(' ') {
                Some((c, a)) => (c, a.trim()),
                None => (rest, ""),
            };
            match cmd {
                "quit" | "exit" => break,
                "provider" => {
                    if session.set_provider(arg) {
                        println!(
                            "provider={} model={}",
                            session.provider().name(),
                            session.model()
                        );
                    } else {
                        print_locked();
                    }
                }
                "model" => {
                    if session.set_model(arg) {
                        println!("model={}", session.model());
                    } else {
                        print_locked();
                    }
                }
                "key" => {
                    if session.set_api_key(arg) {
                        println!("api key set");
                    } else {
                        print_locked();
                    }
                }
                "instructions" => {
                    if session.set_instructions(arg) {
                        println!("instructions set");
                    } else {
                        print_locked();
                    }
                }
                other => println!("unknown command: /{}", other),
            }
            continue;
        }

        session.set_input(line);
        send_turn(&client, &mut session).await;
    }

    Ok(())
}

/**
 * \brief 提交当前输入并把流式回复边收边打印。
 */
async fn send_turn(client: &ChatClient, session: &mut Session) {
    let Some(request) = session.submit() else {
        return;
    };

    telemetry::log_event(
        "cli.chat",
        &format!(
            "provider={} model={} msgs={}",
            session.provider().name(),
            session.model(),
            request.messages.len()
        ),
    );

    let mut stream = match client.stream(&request).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("request error: {}", e);
            return;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(delta) => {
                print!("{}", delta);
                session.apply_delta(&delta);
                use std::io::Write;
                std::io::stdout().flush().ok();
            }
            Err(e) => {
                eprintln!();
                eprintln!("stream error: {}", e);
                break;
            }
        }
    }
    session.finish_stream();
    println!();
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    std::io::stdout().flush().ok();
}

fn print_locked() {
    println!("configuration is locked once the conversation has messages");
}
