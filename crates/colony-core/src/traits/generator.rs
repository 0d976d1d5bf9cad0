use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Generator, GeneratorArg};

#[async_trait]
pub trait GeneratorStore: Send + Sync {
    async fn add_generator(&self, generator: &Generator) -> Result<()>;

    async fn get_generator(&self, id: &str) -> Result<Option<Generator>>;

    async fn find_generator_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Generator>>;

    async fn list_generators(&self) -> Result<Vec<Generator>>;

    /// Remove a generator and its queued packets. Returns false if unknown.
    async fn remove_generator(&self, id: &str) -> Result<bool>;

    async fn update_generator(&self, generator: &Generator, expected_version: u64) -> Result<Generator>;

    /// Append a packet; the store assigns `seq`.
    async fn add_generator_arg(&self, arg: &GeneratorArg) -> Result<GeneratorArg>;

    async fn count_generator_args(&self, generator_id: &str) -> Result<usize>;

    /// Atomically remove and return up to `n` of the oldest packets.
    async fn take_generator_args(&self, generator_id: &str, n: usize) -> Result<Vec<GeneratorArg>>;

    /// Put previously taken packets back at their original queue positions.
    async fn restore_generator_args(&self, args: &[GeneratorArg]) -> Result<()>;
}
