//! Medical report analysis: extraction, interpretation and confidence scoring.
//!
//! Interpretation runs as a two-stage [`AnalysisPipeline`]: a model-backed
//! primary stage and a deterministic keyword stage used when the primary
//! fails under the configured [`DegradationPolicy`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::AnalyzerConfig;
use crate::document::{
    classify, extract_pdf, format_file_size, DocumentType, LopdfExtractor, PdfExtractor,
    PdfMetadata, UploadedFile, MAX_FILE_SIZE,
};
use crate::error::{BloomError, Result};
use crate::llm::{GenerationOptions, LlmGateway};
use crate::message::ConversationMessage;
use crate::telemetry::{DegradationPolicy, TelemetryCollector};

pub const ANALYSIS_SYSTEM_PROMPT: &str = "You are a medical AI assistant specializing in analyzing medical reports and documents.

Your task is to:
1. Analyze the provided medical document text
2. Identify key medical findings, test results, and health indicators
3. Provide clear, easy-to-understand explanations
4. Highlight any concerning findings that may need attention
5. Suggest follow-up actions or lifestyle recommendations where appropriate
6. Use medical terminology appropriately but explain complex terms

Format your response with:
✓ for normal/good findings
⚠️ for concerning findings that need attention
• for recommendations and suggestions

Always remind users that this is an AI analysis and they should consult healthcare professionals for medical advice.

Keep your analysis focused, clear, and actionable.";

/// Texts at or below this many characters are not sent for interpretation.
pub const MIN_ANALYZABLE_CHARS: usize = 50;
pub const PREVIEW_CHARS: usize = 1000;

pub const FALLBACK_CONFIDENCE: f32 = 0.4;
pub const IMAGE_CONFIDENCE: f32 = 0.3;
pub const NO_TEXT_CONFIDENCE: f32 = 0.1;
const MAX_CONFIDENCE: f32 = 0.9;

const POSITIVE_TERMS: [&str; 5] = ["normal", "healthy", "good", "excellent", "within range"];
const CONCERNING_TERMS: [&str; 6] = [
    "elevated",
    "high",
    "low",
    "abnormal",
    "outside range",
    "concerning",
];
const TEST_TERMS: [&str; 6] = [
    "blood",
    "glucose",
    "pressure",
    "cholesterol",
    "hemoglobin",
    "white blood cell",
];

const IMAGE_ANALYSIS: &str = "This appears to be an image file. For the most accurate analysis, please upload a PDF version of your medical report. If you only have an image, please ensure it's clear and readable.";
const NO_TEXT_ANALYSIS: &str = "Unable to extract meaningful text from this document. Please ensure the file is not corrupted and contains readable text.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<usize>,
    pub file_size: String,
    pub file_name: String,
    pub extraction_method: String,
    #[serde(flatten)]
    pub document: PdfMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub analysis: String,
    /// At most the preview length, with `...` appended when cut.
    pub extracted_text: String,
    pub confidence: f32,
    pub document_type: DocumentType,
    pub metadata: AnalysisMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub analysis: String,
    pub confidence: f32,
}

#[async_trait]
pub trait AnalysisStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(&self, text: &str, file_name: &str) -> Result<StageOutput>;
}

/// Heuristic quality score in `[0.5, 0.9]`; not a calibrated probability.
///
/// Keyword signals match case-sensitively, unlike the fallback scan.
pub fn calculate_confidence(extracted_text: &str, analysis: &str) -> f32 {
    let mut confidence: f32 = 0.5;

    if extracted_text.chars().count() > 500 {
        confidence += 0.2;
    }
    if ["lab", "test", "result"].iter().any(|t| extracted_text.contains(t)) {
        confidence += 0.1;
    }
    if ["blood", "pressure", "glucose"].iter().any(|t| extracted_text.contains(t)) {
        confidence += 0.1;
    }
    if analysis.contains('✓') || analysis.contains("⚠️") {
        confidence += 0.1;
    }
    if analysis.chars().count() > 200 {
        confidence += 0.1;
    }

    confidence.min(MAX_CONFIDENCE)
}

fn found_terms<'a>(haystack: &str, terms: &[&'a str]) -> Vec<&'a str> {
    terms.iter().copied().filter(|t| haystack.contains(t)).collect()
}

/// Deterministic summary built from keyword hits.
pub fn fallback_analysis(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut analysis = String::from("Document Analysis Summary:\n\n");

    let tests = found_terms(&lower, &TEST_TERMS);
    if !tests.is_empty() {
        analysis.push_str(&format!("Detected test types: {}\n\n", tests.join(", ")));
    }
    let positive = found_terms(&lower, &POSITIVE_TERMS);
    if !positive.is_empty() {
        analysis.push_str(&format!("✓ Positive findings detected: {}\n", positive.join(", ")));
    }
    let concerning = found_terms(&lower, &CONCERNING_TERMS);
    if !concerning.is_empty() {
        analysis.push_str(&format!(
            "⚠️ Areas that may need attention: {}\n",
            concerning.join(", ")
        ));
    }

    analysis.push_str("\n• Please consult with your healthcare provider for detailed interpretation\n");
    analysis.push_str("• This is a basic automated analysis - professional review is recommended\n");
    analysis.push_str("\nNote: This analysis was generated using fallback methods. For more detailed insights, please ensure your LLM service is properly configured.");
    analysis
}

/// Asks the active model for a structured interpretation.
pub struct LlmAnalysisStage {
    gateway: Arc<LlmGateway>,
}

impl LlmAnalysisStage {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    fn prompt(text: &str, file_name: &str) -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::system(ANALYSIS_SYSTEM_PROMPT),
            ConversationMessage::user(format!(
                "Please analyze this medical document: \"{file_name}\"\n\n{text}\n\nProvide a comprehensive analysis of the findings, highlighting key health indicators, any areas of concern, and recommendations."
            )),
        ]
    }
}

#[async_trait]
impl AnalysisStage for LlmAnalysisStage {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn analyze(&self, text: &str, file_name: &str) -> Result<StageOutput> {
        let response = self
            .gateway
            .generate_response(&Self::prompt(text, file_name), &GenerationOptions::new(0.3, 1000))
            .await?;
        Ok(StageOutput {
            confidence: calculate_confidence(text, &response.content),
            analysis: response.content,
        })
    }
}

pub struct KeywordAnalysisStage;

#[async_trait]
impl AnalysisStage for KeywordAnalysisStage {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn analyze(&self, text: &str, _file_name: &str) -> Result<StageOutput> {
        Ok(StageOutput {
            analysis: fallback_analysis(text),
            confidence: FALLBACK_CONFIDENCE,
        })
    }
}

pub struct AnalysisPipeline {
    primary: Arc<dyn AnalysisStage>,
    fallback: Arc<dyn AnalysisStage>,
    policy: DegradationPolicy,
    telemetry: Option<TelemetryCollector>,
}

impl AnalysisPipeline {
    pub fn new(primary: Arc<dyn AnalysisStage>, fallback: Arc<dyn AnalysisStage>) -> Self {
        Self {
            primary,
            fallback,
            policy: DegradationPolicy::default(),
            telemetry: None,
        }
    }

    /// Model-backed primary with the keyword fallback.
    pub fn with_gateway(gateway: Arc<LlmGateway>) -> Self {
        Self::new(
            Arc::new(LlmAnalysisStage::new(gateway)),
            Arc::new(KeywordAnalysisStage),
        )
    }

    pub fn with_policy(mut self, policy: DegradationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub async fn run(&self, text: &str, file_name: &str) -> Result<StageOutput> {
        match self.primary.analyze(text, file_name).await {
            Ok(output) => Ok(output),
            Err(err) if self.policy.should_degrade(&err) => {
                warn!(
                    stage = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %err,
                    "analysis stage failed, degrading"
                );
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_failure(self.primary.name(), err.to_string(), 0);
                    telemetry.record(
                        "fallback_used",
                        json!({ "stage": self.fallback.name(), "file": file_name }),
                    );
                }
                self.fallback.analyze(text, file_name).await
            }
            Err(err) => Err(err),
        }
    }
}

pub struct DocumentAnalyzer {
    pipeline: AnalysisPipeline,
    extractor: Arc<dyn PdfExtractor>,
    max_file_size: usize,
    preview_chars: usize,
}

impl DocumentAnalyzer {
    pub fn new(pipeline: AnalysisPipeline) -> Self {
        Self {
            pipeline,
            extractor: Arc::new(LopdfExtractor),
            max_file_size: MAX_FILE_SIZE,
            preview_chars: PREVIEW_CHARS,
        }
    }

    pub fn from_config(gateway: Arc<LlmGateway>, cfg: &AnalyzerConfig) -> Self {
        Self {
            max_file_size: cfg.max_file_size,
            preview_chars: cfg.extracted_preview_chars,
            ..Self::new(AnalysisPipeline::with_gateway(gateway))
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PdfExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.pipeline.telemetry = Some(telemetry);
        self
    }

    /// Any failure surfaces as `BloomError::Analysis`.
    pub async fn analyze_document(&self, file: &UploadedFile) -> Result<AnalysisResult> {
        self.analyze_inner(file).await.map_err(BloomError::into_analysis)
    }

    async fn analyze_inner(&self, file: &UploadedFile) -> Result<AnalysisResult> {
        let document_type = classify(file)?;

        let (text, pages, extraction_method, document) = match document_type {
            DocumentType::Pdf => {
                let extracted = extract_pdf(self.extractor.as_ref(), file, self.max_file_size)?;
                (
                    extracted.text,
                    Some(extracted.pages),
                    "PDF text extraction",
                    extracted.metadata,
                )
            }
            _ => (
                format!(
                    "[Image file: {}] - OCR analysis not yet implemented. Please upload a PDF version of your medical report for text analysis.",
                    file.file_name
                ),
                None,
                "Image file detected",
                PdfMetadata::default(),
            ),
        };

        let output = if document_type == DocumentType::Image {
            StageOutput {
                analysis: IMAGE_ANALYSIS.into(),
                confidence: IMAGE_CONFIDENCE,
            }
        } else if text.chars().count() > MIN_ANALYZABLE_CHARS {
            self.pipeline.run(&text, &file.file_name).await?
        } else {
            StageOutput {
                analysis: NO_TEXT_ANALYSIS.into(),
                confidence: NO_TEXT_CONFIDENCE,
            }
        };

        info!(
            file = %file.file_name,
            document_type = ?document_type,
            confidence = output.confidence,
            "document analyzed"
        );

        Ok(AnalysisResult {
            analysis: output.analysis,
            extracted_text: truncate_preview(&text, self.preview_chars),
            confidence: output.confidence,
            document_type,
            metadata: AnalysisMetadata {
                pages,
                file_size: format_file_size(file.size() as u64),
                file_name: file.file_name.clone(),
                extraction_method: extraction_method.into(),
                document,
            },
        })
    }
}

fn truncate_preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
