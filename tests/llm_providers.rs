use std::time::Duration;

use bloombuddy_engine::{
    BloomError, ConversationMessage, GenerationOptions, LlmGateway, ModelConfig, Provider,
    ProviderConfig,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn conversation() -> Vec<ConversationMessage> {
    vec![
        ConversationMessage::system("You are BloomBuddy."),
        ConversationMessage::assistant("Hello! How are you feeling?"),
        ConversationMessage::user("I have a headache."),
        ConversationMessage::user("It started this morning."),
    ]
}

fn gateway(provider: Provider, cfg: ProviderConfig) -> LlmGateway {
    let mut model = ModelConfig {
        default_provider: provider,
        timeout_ms: 5_000,
        ..ModelConfig::default()
    };
    match provider {
        Provider::OpenAi => model.openai = cfg,
        Provider::Anthropic => model.anthropic = cfg,
        Provider::Google => model.google = cfg,
    }
    LlmGateway::from_config(&model).unwrap()
}

#[tokio::test]
async fn openai_sends_bearer_and_full_transcript() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "max_tokens": 256,
            "stream": false,
            "messages": [
                { "role": "system", "content": "You are BloomBuddy." },
                { "role": "assistant", "content": "Hello! How are you feeling?" },
                { "role": "user", "content": "I have a headache." },
                { "role": "user", "content": "It started this morning." }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{ "message": { "role": "assistant", "content": "Drink water." } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(
        Provider::OpenAi,
        ProviderConfig {
            api_key: Some("sk-test".into()),
            endpoint: Some(server.uri()),
            model: Some("gpt-4o-mini".into()),
            ..ProviderConfig::default()
        },
    );
    let response = gateway
        .generate_response(&conversation(), &GenerationOptions::new(0.5, 256))
        .await
        .unwrap();

    assert_eq!(response.content, "Drink water.");
    assert_eq!(response.model, "gpt-4o-mini-2024");
    assert_eq!(response.provider, Provider::OpenAi);
    assert_eq!(response.usage.unwrap().total_tokens, 15);
}

#[tokio::test]
async fn anthropic_direct_merges_turns_and_drops_leading_assistant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "anthropic-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "system": "You are BloomBuddy.",
            "max_tokens": 8000,
            "messages": [
                { "role": "user", "content": "I have a headache.\n\nIt started this morning." }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "Rest in a dark room." }],
            "usage": { "input_tokens": 20, "output_tokens": 6 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(
        Provider::Anthropic,
        ProviderConfig {
            api_key: Some("anthropic-key".into()),
            endpoint: Some(format!("{}/v1/messages", server.uri())),
            ..ProviderConfig::default()
        },
    );
    let response = gateway
        .generate_response(&conversation(), &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "Rest in a dark room.");
    assert_eq!(response.model, "claude-3-5-sonnet-20241022");
    let usage = response.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 20);
    assert_eq!(usage.total_tokens, 26);
}

#[tokio::test]
async fn anthropic_proxy_needs_no_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/llm/chat"))
        .and(body_partial_json(json!({
            "provider": "anthropic",
            "system": "You are BloomBuddy.",
            "options": { "maxTokens": 1000 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "Proxied reply",
            "model": "claude-proxy",
            "usage": { "promptTokens": 1, "completionTokens": 2, "totalTokens": 3 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(
        Provider::Anthropic,
        ProviderConfig {
            proxy_url: Some(format!("{}/api/", server.uri())),
            ..ProviderConfig::default()
        },
    );
    assert!(gateway.available_providers()[1].configured);

    let response = gateway
        .generate_response(&conversation(), &GenerationOptions::new(0.5, 1000))
        .await
        .unwrap();
    assert_eq!(response.content, "Proxied reply");
    assert_eq!(response.model, "claude-proxy");
    assert_eq!(response.usage.unwrap().completion_tokens, 2);
}

#[tokio::test]
async fn gemini_uses_system_instruction_and_model_role() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-pro:generateContent"))
        .and(query_param("key", "g key"))
        .and(body_partial_json(json!({
            "systemInstruction": { "parts": [{ "text": "You are BloomBuddy." }] },
            "generationConfig": { "maxOutputTokens": 4000 },
            "contents": [
                { "role": "model", "parts": [{ "text": "Hello! How are you feeling?" }] },
                { "role": "user", "parts": [{ "text": "I have a headache." }] },
                { "role": "user", "parts": [{ "text": "It started this morning." }] }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": "Try a cold compress." }] } }],
            "usageMetadata": { "promptTokenCount": 9, "candidatesTokenCount": 4, "totalTokenCount": 13 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(
        Provider::Google,
        ProviderConfig {
            api_key: Some("g key".into()),
            endpoint: Some(server.uri()),
            ..ProviderConfig::default()
        },
    );
    let response = gateway
        .generate_response(&conversation(), &GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(response.content, "Try a cold compress.");
    assert_eq!(response.provider, Provider::Google);
    assert_eq!(response.usage.unwrap().total_tokens, 13);
}

#[tokio::test]
async fn provider_error_message_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided" }
        })))
        .mount(&server)
        .await;

    let gateway = gateway(
        Provider::OpenAi,
        ProviderConfig {
            api_key: Some("sk-wrong".into()),
            endpoint: Some(server.uri()),
            ..ProviderConfig::default()
        },
    );
    let err = gateway
        .generate_response(&conversation(), &GenerationOptions::default())
        .await
        .unwrap_err();
    match err {
        BloomError::LanguageModel(message) => {
            assert!(message.contains("Incorrect API key provided"), "{message}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_is_reported_as_such() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let gateway = gateway(
        Provider::OpenAi,
        ProviderConfig {
            api_key: Some("sk-test".into()),
            endpoint: Some(server.uri()),
            ..ProviderConfig::default()
        },
    );
    let err = gateway
        .generate_response(&conversation(), &GenerationOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LLM_ERROR");
    assert!(err.to_string().contains("rate limit"));
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_json(json!({ "choices": [] })),
        )
        .mount(&server)
        .await;

    let mut model = ModelConfig {
        default_provider: Provider::OpenAi,
        timeout_ms: 100,
        ..ModelConfig::default()
    };
    model.openai = ProviderConfig {
        api_key: Some("sk-test".into()),
        endpoint: Some(server.uri()),
        ..ProviderConfig::default()
    };
    let gateway = LlmGateway::from_config(&model).unwrap();
    let err = gateway
        .generate_response(&conversation(), &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BloomError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn unconfigured_provider_fails_without_network() {
    let gateway = gateway(Provider::Google, ProviderConfig::default());
    let err = gateway
        .generate_response(&conversation(), &GenerationOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MISSING_CREDENTIAL");
}
