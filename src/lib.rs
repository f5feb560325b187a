//! Backend engine for the BloomBuddy health companion.
//!
//! The crate provides:
//! - Persistent, bounded conversation memory (`MemoryManager`) over a pluggable `SessionStore`.
//! - Medical report validation, PDF extraction and LLM-assisted analysis (`DocumentAnalyzer`).
//! - A multi-provider `LlmGateway` over the `LanguageModel` trait.
//! - A `ChatSession` tying the three together, plus a disease-risk `PredictionClient`.

mod analyzer;
mod chat;
mod config;
mod document;
mod error;
mod llm;
mod memory;
mod message;
mod prediction;
#[cfg(feature = "server")]
pub mod server;
mod storage;
mod telemetry;

pub use analyzer::{
    calculate_confidence, fallback_analysis, AnalysisMetadata, AnalysisPipeline, AnalysisResult,
    AnalysisStage, DocumentAnalyzer, KeywordAnalysisStage, LlmAnalysisStage, StageOutput,
};
pub use chat::{CancelHandle, ChatMessage, ChatMessageKind, ChatSession, SendOutcome};
pub use config::{
    AnalyzerConfig, AppConfig, MemoryConfig, ModelConfig, PredictionConfig, ProviderConfig,
    ServerConfig, StorageBackend, StorageConfig,
};
pub use document::{
    classify, extract_pdf, format_file_size, is_valid_pdf, preprocess_text, validate_pdf,
    DocumentType, ExtractedPdf, LopdfExtractor, PdfExtractor, PdfMetadata, RawPdf, UploadedFile,
    IMAGE_MIME_TYPES, MAX_FILE_SIZE, PDF_MIME_TYPE,
};
pub use error::{BloomError, Result};
pub use llm::{
    AnthropicClient, GeminiClient, GenerationOptions, LanguageModel, LlmGateway, LlmResponse,
    OpenAIClient, Provider, ProviderStatus, StubModel, TokenUsage,
};
pub use memory::{
    ConversationMemory, MemoryManager, MemoryOptions, ReportContext, UserProfile,
    UserProfileUpdate, DEFAULT_MAX_MESSAGES, DEFAULT_STORAGE_KEY,
};
pub use message::{ConversationMessage, MessageDraft, MessageMetadata, MessageType, Role};
pub use prediction::{
    analyze_risk_factors, fallback_prediction, next_steps, Disease, EnhancedPrediction,
    PredictionClient, PredictionInput, PredictionResult, RiskFactors, RiskLevel, Suggestions,
};
#[cfg(feature = "persistence")]
pub use storage::SqlSessionStore;
pub use storage::{open_store, FileSessionStore, InMemorySessionStore, SessionStore};
pub use telemetry::{
    init_tracing, DegradationPolicy, FailureRecord, LogFormat, TelemetryCollector, TelemetryEvent,
    DEFAULT_TELEMETRY_CAPACITY,
};
