use crate::llm::{ProviderKind, DEFAULT_INSTRUCTIONS};
use crate::models::{ChatRequest, Message, Role};

/**
 * \brief 会话阶段：无消息时配置可改，首次提交后锁定。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Active,
}

/**
 * \brief 单个会话的全部可变状态：配置、待发送输入与消息历史。
 *
 * 状态显式装在结构体里传给渲染与事件处理方，不依赖环境全局量。
 */
#[derive(Debug, Clone)]
pub struct Session {
    provider: ProviderKind,
    api_key: String,
    model: String,
    instructions: String,
    input: String,
    messages: Vec<Message>,
    /** \brief 末尾的助手消息是否仍在接收增量 */
    streaming: bool,
}

impl Session {
    pub fn new() -> Self {
        let provider = ProviderKind::Google;
        Session {
            provider,
            api_key: String::new(),
            model: provider.default_model().to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            input: String::new(),
            messages: Vec::new(),
            streaming: false,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.messages.is_empty() {
            Phase::Empty
        } else {
            Phase::Active
        }
    }

    /**
     * \brief 会话是否已锁定配置（存在至少一条消息）。
     */
    pub fn locked(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn model(&self) -> &str {
        self.model.as_str()
    }

    pub fn instructions(&self) -> &str {
        self.instructions.as_str()
    }

    pub fn input(&self) -> &str {
        self.input.as_str()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /**
     * \brief 切换 Provider 并把模型重置为其默认值；锁定后不生效。
     * \return 是否发生了修改
     */
    pub fn set_provider(&mut self, name: &str) -> bool {
        if self.locked() {
            return false;
        }
        self.provider = ProviderKind::from_name(name);
        self.model = self.provider.default_model().to_string();
        true
    }

    pub fn set_api_key(&mut self, key: &str) -> bool {
        if self.locked() {
            return false;
        }
        self.api_key = key.to_string();
        true
    }

    pub fn set_model(&mut self, model: &str) -> bool {
        if self.locked() {
            return false;
        }
        self.model = model.to_string();
        true
    }

    pub fn set_instructions(&mut self, text: &str) -> bool {
        if self.locked() {
            return false;
        }
        self.instructions = text.to_string();
        true
    }

    pub fn set_input(&mut self, text: &str) {
        self.input = text.to_string();
    }

    /**
     * \brief 提交当前输入：追加 user 消息并返回携带完整历史的请求体。
     *
     * 空白输入不产生任何消息，返回 None。若上一路流尚未结束，
     * 先把部分助手回复按现状定稿，再继续本次提交（上一路由传输层取消）。
     */
    pub fn submit(&mut self) -> Option<ChatRequest> {
        let content = self.input.trim().to_string();
        if content.is_empty() {
            return None;
        }
        if self.streaming {
            self.finish_stream();
        }
        self.input.clear();
        self.messages.push(Message::new(Role::User, content));
        Some(self.request())
    }

    /**
     * \brief 接收一段流式增量，追加到末尾的助手消息；首个增量会新建该消息。
     */
    pub fn apply_delta(&mut self, delta: &str) {
        if !self.streaming {
            self.streaming = true;
            self.messages.push(Message::new(Role::Assistant, ""));
        }
        if let Some(last) = self.messages.last_mut() {
            last.content.push_str(delta);
        }
    }

    /**
     * \brief 结束当前流，定稿末尾的助手消息。
     */
    pub fn finish_stream(&mut self) {
        self.streaming = false;
    }

    fn request(&self) -> ChatRequest {
        ChatRequest {
            messages: self.messages.clone(),
            provider: Some(self.provider.name().to_string()),
            api_key: if self.api_key.is_empty() {
                None
            } else {
                Some(self.api_key.clone())
            },
            model: Some(self.model.clone()),
            instructions: Some(self.instructions.clone()),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_empty_with_google_defaults() {
        let s = Session::new();
        assert_eq!(s.phase(), Phase::Empty);
        assert!(!s.locked());
        assert_eq!(s.provider(), ProviderKind::Google);
        assert_eq!(s.model(), "gemini-2.5-flash-preview-04-17");
        assert_eq!(s.instructions(), DEFAULT_INSTRUCTIONS);
    }

    #[test]
    fn provider_change_resets_model_to_provider_default() {
        let mut s = Session::new();
        assert!(s.set_model("gemini-pro"));
        assert!(s.set_provider("openai"));
        assert_eq!(s.model(), "gpt-4o");
        assert!(s.set_provider("deepseek"));
        assert_eq!(s.model(), "deepseek-chat");
    }

    #[test]
    fn empty_or_whitespace_input_submits_nothing() {
        let mut s = Session::new();
        assert!(s.submit().is_none());
        s.set_input("   \n");
        assert!(s.submit().is_none());
        assert!(s.messages().is_empty());
        assert_eq!(s.phase(), Phase::Empty);
    }

    #[test]
    fn first_submit_locks_configuration() {
        let mut s = Session::new();
        s.set_input("Hi");
        let req = s.submit().expect("submit");
        assert_eq!(s.phase(), Phase::Active);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[0].content, "Hi");
        assert_eq!(req.provider.as_deref(), Some("google"));
        assert_eq!(req.instructions.as_deref(), Some(DEFAULT_INSTRUCTIONS));
        assert!(req.api_key.is_none());

        let model_before = s.model().to_string();
        assert!(!s.set_provider("openai"));
        assert!(!s.set_model("gpt-4o"));
        assert!(!s.set_api_key("sk-x"));
        assert!(!s.set_instructions("other"));
        assert_eq!(s.model(), model_before);
    }

    #[test]
    fn deltas_accumulate_into_one_assistant_message() {
        let mut s = Session::new();
        s.set_input("Hello");
        s.submit().unwrap();
        s.apply_delta("Hi");
        s.apply_delta(" there");
        assert!(s.streaming());
        s.finish_stream();
        assert!(!s.streaming());

        let msgs = s.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].content, "Hi there");
    }

    #[test]
    fn resubmit_mid_stream_finalizes_partial_reply() {
        let mut s = Session::new();
        s.set_input("first");
        s.submit().unwrap();
        s.apply_delta("part");

        s.set_input("second");
        let req = s.submit().expect("resubmit");
        assert!(!s.streaming());
        // 历史：user "first", assistant "part"（部分）, user "second"
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[1].role, Role::Assistant);
        assert_eq!(req.messages[1].content, "part");
        assert_eq!(req.messages[2].content, "second");

        // 新一路流在部分回复之后另起一条助手消息
        s.apply_delta("fresh");
        assert_eq!(s.messages().len(), 4);
        assert_eq!(s.messages()[3].content, "fresh");
    }

    #[test]
    fn deepseek_request_carries_full_history_and_config() {
        let mut s = Session::new();
        assert!(s.set_provider("deepseek"));
        assert!(s.set_api_key("sk-ds"));
        s.set_input("Hello");
        let req = s.submit().expect("submit");
        assert_eq!(req.provider.as_deref(), Some("deepseek"));
        assert_eq!(req.model.as_deref(), Some("deepseek-chat"));
        assert_eq!(req.api_key.as_deref(), Some("sk-ds"));
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn unknown_provider_name_behaves_like_google() {
        let mut s = Session::new();
        assert!(s.set_provider("anthropic"));
        assert_eq!(s.provider(), ProviderKind::Google);
        assert_eq!(s.model(), "gemini-2.5-flash-preview-04-17");
    }
}
