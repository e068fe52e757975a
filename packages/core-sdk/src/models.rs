use serde::{Deserialize, Serialize};

/**
 * \brief 消息角色，封闭集合，序列化为小写。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /**
     * \brief 角色的小写名称，与序列化形式一致。
     */
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/**
 * \brief POST /api/chat 请求体：完整会话历史加可选配置覆盖。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /** \brief 按顺序排列的完整会话历史 */
    pub messages: Vec<Message>,
    /** \brief Provider 名称（可选，默认 google，未知名称同样回退） */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /** \brief API 密钥（可选，原样透传给 Provider） */
    #[serde(default, rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /** \brief 模型名（可选，按 Provider 取默认值） */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /** \brief 系统指令（可选） */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}
