//! Provider adapters for the Strand runtime.
//!
//! Every LLM backend is reduced to one contract: [`traits::Provider`]
//! streams normalized [`strand_domain::stream::StreamEvent`]s. The
//! [`normalize::StreamNormalizer`] enforces the robustness rules shared by
//! all adapters; [`classifier`] implements the pre-call intent probe.

pub mod anthropic;
pub mod classifier;
pub mod normalize;
pub mod openai_compat;
pub mod registry;
pub mod sse;
pub mod testing;
pub mod traits;

pub use registry::ProviderRegistry;
pub use traits::{Provider, TurnRequest};
