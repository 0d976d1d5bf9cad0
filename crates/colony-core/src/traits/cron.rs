use async_trait::async_trait;

use crate::error::Result;
use crate::types::Cron;

#[async_trait]
pub trait CronStore: Send + Sync {
    async fn add_cron(&self, cron: &Cron) -> Result<()>;

    async fn get_cron(&self, id: &str) -> Result<Option<Cron>>;

    async fn find_cron_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Cron>>;

    async fn list_crons(&self) -> Result<Vec<Cron>>;

    async fn remove_cron(&self, id: &str) -> Result<bool>;

    async fn update_cron(&self, cron: &Cron, expected_version: u64) -> Result<Cron>;
}
