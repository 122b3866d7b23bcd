use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::AppError;

/// Persona the chat assistant speaks with. The assistant answers questions
/// about the product and nudges interested visitors toward a consultation;
/// the fixed handoff phrase is what the frontend watches for to open the
/// contact form.
const SYSTEM_PROMPT: &str = "You are the friendly AI assistant for a spreadsheet insights \
platform. You help potential clients learn about the product and guide them toward scheduling \
consultations.\n\n\
**About the product:**\n\
- Upload spreadsheets (CSV, XLS, XLSX) and get instant analysis with charts and KPIs\n\
- Connect live Google Sheets or Excel Online workbooks for scheduled reports\n\
- Compare reports over time to track how key metrics move\n\
- AI-generated summaries with key findings and recommendations\n\n\
**Pricing:**\n\
- Free 30-minute initial consultation\n\
- Custom quotes tailored to each business\n\
- Subscription-based plans for ongoing use\n\n\
**Your role:**\n\
- Answer questions about features, pricing and processes concisely\n\
- When users show interest, proactively suggest scheduling a free consultation\n\
- After suggesting a consultation, if they agree (yes/sure/interested), respond with: \
\"Great! I'll direct you to our contact form so our team can reach out to you.\"\n\
- Keep responses short (2-4 sentences typically)\n\
- Don't make up capabilities not listed above\n\
- Always end with a question to keep the conversation flowing";

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

/// Build the streaming chat completion payload sent to the gateway.
pub fn build_payload(model: &str, messages: &[ChatMessage]) -> Value {
    let mut all = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];
    all.extend(
        messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content })),
    );
    json!({
        "model": model,
        "messages": all,
        "stream": true,
    })
}

/// Relay one chat conversation to the AI gateway and stream the SSE reply
/// straight back to the client without buffering.
pub async fn relay(
    client: &reqwest::Client,
    config: &Config,
    request: ChatRequest,
) -> Result<Response, AppError> {
    let api_key = config
        .ai_api_key
        .as_deref()
        .ok_or_else(|| AppError::Internal("AI gateway key is not configured".to_string()))?;

    log::info!("relaying chat request with {} messages", request.messages.len());

    let response = client
        .post(&config.ai_gateway_url)
        .bearer_auth(api_key)
        .json(&build_payload(&config.ai_model, &request.messages))
        .send()
        .await
        .map_err(|e| AppError::Internal(format!("AI gateway unreachable: {e}")))?;

    let status = response.status();
    if status.as_u16() == 429 {
        return Err(AppError::RateLimited);
    }
    if status.as_u16() == 402 {
        return Err(AppError::PaymentRequired);
    }
    if !status.is_success() {
        // Anything else surfaces as the generic 500 envelope.
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Internal(format!(
            "AI gateway returned {status}: {}",
            crate::error::truncate_message(&body, 500)
        )));
    }

    let stream = response.bytes_stream().map_err(std::io::Error::other);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(format!("failed to build stream response: {e}")))
}
