use crate::error::AppError;
use crate::orders::types::{
    parse_order_list_payload, Order, OrderStatus, RejectReason, Restaurant, RestaurantWire,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Serialize;

/// Narrow surface of the external order service.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn get_orders(&self) -> Result<Vec<Order>, AppError>;

    async fn accept_order(&self, order_id: &str, prep_minutes: u32) -> Result<(), AppError>;

    async fn reject_order(&self, order_id: &str, reason: &RejectReason) -> Result<(), AppError>;

    async fn mark_order_ready(&self, order_id: &str) -> Result<(), AppError>;

    async fn get_current_restaurant(&self) -> Result<Restaurant, AppError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptOrderBody {
    estimated_prep_minutes: u32,
}

#[derive(Debug, Serialize)]
struct RejectOrderBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateStatusBody {
    status: &'static str,
}

#[derive(Debug, Clone)]
pub struct HttpOrderApi {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpOrderApi {
    pub fn new(client: Client, base_url: Url, auth_token: Option<String>) -> Self {
        Self {
            client,
            base_url,
            auth_token,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn join_endpoint(base_url: &Url, path: &str) -> Result<Url, AppError> {
    base_url
        .join(path)
        .map_err(|error| AppError::InvalidArgument(format!("invalid endpoint '{path}': {error}")))
}

fn orders_endpoint(base_url: &Url) -> Result<Url, AppError> {
    join_endpoint(base_url, "/api/orders/restaurant")
}

fn order_action_endpoint(base_url: &Url, order_id: &str, action: &str) -> Result<Url, AppError> {
    let mut endpoint = join_endpoint(base_url, "/api/orders/")?;
    endpoint
        .path_segments_mut()
        .map_err(|_| AppError::InvalidArgument("base url cannot carry a path".to_string()))?
        .pop_if_empty()
        .push(order_id)
        .push(action);
    Ok(endpoint)
}

fn current_restaurant_endpoint(base_url: &Url) -> Result<Url, AppError> {
    join_endpoint(base_url, "/api/restaurants/me")
}

/// Maps a non-2xx response to the error taxonomy. Conflicts, and 400s whose
/// body says the transition is not possible, mean the order has already moved
/// on and are kept distinguishable from generic failures.
pub fn classify_failure(order_id: Option<&str>, status: StatusCode, body: &str) -> AppError {
    let message = body.trim().chars().take(256).collect::<String>();
    if status == StatusCode::NOT_FOUND {
        return AppError::NotFound(order_id.unwrap_or("orders").to_string());
    }

    if let Some(order_id) = order_id {
        let lowered = message.to_ascii_lowercase();
        let conflict = status == StatusCode::CONFLICT
            || (status == StatusCode::BAD_REQUEST
                && (lowered.contains("already")
                    || lowered.contains("cannot transition")
                    || lowered.contains("invalid status")));
        if conflict {
            return AppError::IncompatibleState {
                order_id: order_id.to_string(),
                message,
            };
        }
    }

    AppError::Api {
        status: status.as_u16(),
        message,
    }
}

async fn expect_success(
    order_id: Option<&str>,
    response: reqwest::Response,
) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(order_id, status, &body))
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn get_orders(&self) -> Result<Vec<Order>, AppError> {
        let endpoint = orders_endpoint(&self.base_url)?;
        let response = self.authorized(self.client.get(endpoint)).send().await?;
        let response = expect_success(None, response).await?;
        let mut payload = response.bytes().await?.to_vec();
        parse_order_list_payload(payload.as_mut_slice())
    }

    async fn accept_order(&self, order_id: &str, prep_minutes: u32) -> Result<(), AppError> {
        let endpoint = order_action_endpoint(&self.base_url, order_id, "accept")?;
        let body = AcceptOrderBody {
            estimated_prep_minutes: prep_minutes,
        };
        let response = self
            .authorized(self.client.patch(endpoint).json(&body))
            .send()
            .await?;
        expect_success(Some(order_id), response).await?;
        Ok(())
    }

    async fn reject_order(&self, order_id: &str, reason: &RejectReason) -> Result<(), AppError> {
        let endpoint = order_action_endpoint(&self.base_url, order_id, "reject")?;
        let body = RejectOrderBody {
            reason: reason.as_str(),
        };
        let response = self
            .authorized(self.client.patch(endpoint).json(&body))
            .send()
            .await?;
        expect_success(Some(order_id), response).await?;
        Ok(())
    }

    async fn mark_order_ready(&self, order_id: &str) -> Result<(), AppError> {
        let endpoint = order_action_endpoint(&self.base_url, order_id, "status")?;
        let body = UpdateStatusBody {
            status: OrderStatus::Ready.as_str(),
        };
        let response = self
            .authorized(self.client.patch(endpoint).json(&body))
            .send()
            .await?;
        expect_success(Some(order_id), response).await?;
        Ok(())
    }

    async fn get_current_restaurant(&self) -> Result<Restaurant, AppError> {
        let endpoint = current_restaurant_endpoint(&self.base_url)?;
        let response = self.authorized(self.client.get(endpoint)).send().await?;
        let response = expect_success(None, response).await?;
        let mut payload = response.bytes().await?.to_vec();
        let wire: RestaurantWire = simd_json::serde::from_slice(payload.as_mut_slice())?;
        wire.try_into()
    }
}
