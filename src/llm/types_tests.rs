//! Unit tests for reasoning backend wire types.

use super::*;
use serde_json::json;

#[test]
fn test_message_constructors() {
    let msg = Message::system("You are a research assistant");
    assert_eq!(msg.role, MessageRole::System);
    assert_eq!(msg.content, "You are a research assistant");

    assert_eq!(Message::user("q").role, MessageRole::User);
    assert_eq!(Message::assistant("a").role, MessageRole::Assistant);
}

#[test]
fn test_message_role_serializes_lowercase() {
    let value = serde_json::to_value(Message::user("hi")).unwrap();
    assert_eq!(value, json!({"role": "user", "content": "hi"}));
}

#[test]
fn test_chat_request_serialization() {
    let req = ChatRequest::new("qwen-flash", vec![Message::user("test")]).with_temperature(0.3);
    let value = serde_json::to_value(&req).unwrap();

    assert_eq!(value["model"], "qwen-flash");
    assert_eq!(value["temperature"], 0.3);
    assert_eq!(value["response_format"]["type"], "json_object");
    assert_eq!(value["messages"][0]["role"], "user");
}

#[test]
fn test_chat_request_omits_missing_temperature() {
    let req = ChatRequest::new("m", vec![]);
    let value = serde_json::to_value(&req).unwrap();
    assert!(value.get("temperature").is_none());
}

#[test]
fn test_chat_response_first_content() {
    let resp: ChatResponse = serde_json::from_value(json!({
        "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}, "finish_reason": "stop"}],
        "model": "qwen-flash",
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    }))
    .unwrap();

    assert_eq!(resp.first_content(), Some("{\"ok\":true}"));
    assert_eq!(resp.usage.unwrap().total_tokens, Some(15));
}

#[test]
fn test_chat_response_without_choices() {
    let resp: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
    assert!(resp.first_content().is_none());
}

#[test]
fn test_completion_request_clamps_temperature() {
    let req = CompletionRequest::new("plan", vec![]).with_temperature(5.0);
    assert_eq!(req.temperature, Some(2.0));
    assert_eq!(req.schema, "plan");
}

#[test]
fn test_completion_total_tokens() {
    assert_eq!(Completion::text("x").total_tokens(), 0);

    let completion = Completion {
        text: "x".to_string(),
        usage: Some(Usage {
            total_tokens: Some(42),
            ..Usage::default()
        }),
    };
    assert_eq!(completion.total_tokens(), 42);
}
