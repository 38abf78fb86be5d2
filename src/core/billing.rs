use crate::core::api::ApiClient;
use crate::domain::model::{Order, Product, RedirectUrl};
use crate::utils::error::{PortalError, Result};
use reqwest::Method;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest<'a> {
    product_id: &'a str,
    success_url: &'a str,
    cancel_url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PortalRequest<'a> {
    return_url: &'a str,
}

// 付款資料只存在於金流商的托管頁面，這裡只取得導向網址
impl ApiClient {
    pub async fn list_products(&self) -> Result<Vec<Product>> {
        self.get_json(&["billing", "products"], &[]).await
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        self.get_json(&["billing", "orders"], &[]).await
    }

    pub async fn create_checkout_session(
        &self,
        product_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<RedirectUrl> {
        let request = CheckoutRequest {
            product_id,
            success_url,
            cancel_url,
        };
        let redirect: RedirectUrl = self
            .send_json(Method::POST, &["billing", "checkout"], &request)
            .await?;
        ensure_https(redirect)
    }

    pub async fn billing_portal_url(&self, return_url: &str) -> Result<RedirectUrl> {
        let redirect: RedirectUrl = self
            .send_json(Method::POST, &["billing", "portal"], &PortalRequest { return_url })
            .await?;
        ensure_https(redirect)
    }
}

fn ensure_https(redirect: RedirectUrl) -> Result<RedirectUrl> {
    match url::Url::parse(&redirect.url) {
        Ok(url) if url.scheme() == "https" => Ok(redirect),
        _ => Err(PortalError::ValidationError {
            message: format!("Payment provider returned an unusable redirect: {}", redirect.url),
        }),
    }
}
