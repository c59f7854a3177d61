//! 订单授权
//! 信任分、反欺诈与管理员只读策略已在安全管道中执行，这里只回显授权结果

use crate::{
    auth::gate::AuthContext, error::AppError, extract::ApiJson,
    services::policy_service::order_value,
};
use axum::{response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct OrderRequest {
    #[validate(range(min = 0.0))]
    pub price: f64,
    #[validate(range(min = 1.0))]
    pub quantity: f64,
}

pub async fn authorize_order(
    auth: AuthContext,
    ApiJson(body): ApiJson<Value>,
) -> Result<impl IntoResponse, AppError> {
    let request: OrderRequest = serde_json::from_value(body.clone())
        .map_err(|e| AppError::Validation(format!("Invalid order: {}", e)))?;
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let value = order_value(Some(&body));

    tracing::info!(
        request_id = %auth.context.request_id,
        user_id = %auth.identity.user_id,
        order_value = value,
        "Order authorized"
    );

    Ok(Json(json!({
        "success": true,
        "authorized": true,
        "orderValue": value,
        "trustScore": auth.identity.trust_score,
    })))
}
