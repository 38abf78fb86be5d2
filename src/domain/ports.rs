use crate::utils::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub trait ConfigProvider: Send + Sync {
    fn api_base_url(&self) -> &str;
    fn tenant_id(&self) -> Option<&str>;
    fn retry_attempts(&self) -> u32;
    fn retry_delay(&self) -> Duration;
    fn realtime_url(&self) -> &str;
}

/// 已開啟的雙向文字訊息連線
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// `None` 代表對端已關閉連線
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}
