//! Headshot generation collaborators.
//!
//! The gateway only guards and bills generation; the image work itself is an
//! external service behind the [`HeadshotGenerator`] trait. Prompt assembly
//! from styling options happens client-side — the backend forwards a prompt
//! or falls back to the stock one.

pub mod replicate;

use async_trait::async_trait;

/// Prompt used when the client does not supply one.
pub const DEFAULT_PROMPT: &str = "A professional corporate headshot of a smiling person \
including torso, wearing a business suit, neutral background, studio lighting, \
ultra high resolution, sharp focus, professional photography";

/// A finished generation.
#[derive(Debug, Clone)]
pub struct GeneratedHeadshot {
    /// URL of the generated image on the provider's storage.
    pub image_url: String,
}

/// External image-generation service.
#[async_trait]
pub trait HeadshotGenerator: Send + Sync {
    /// Generate a headshot from a source image (URL or data URL) and prompt.
    ///
    /// Implementations return only once the job has reached a terminal
    /// state; a pending job that outlives the polling budget is an error.
    async fn generate(&self, image: &str, prompt: &str) -> anyhow::Result<GeneratedHeadshot>;
}

pub use replicate::ReplicateGenerator;
