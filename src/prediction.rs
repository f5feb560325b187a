//! Client for the external disease-risk model API, with rule-based and
//! model-generated guidance layered on top.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::PredictionConfig;
use crate::error::{BloomError, Result};
use crate::llm::{GenerationOptions, LlmGateway};
use crate::message::ConversationMessage;
use crate::telemetry::TelemetryCollector;

const SUGGESTIONS_SYSTEM_PROMPT: &str = "You are a specialized medical AI assistant with expertise in preventive healthcare and risk assessment.
Your role is to provide evidence-based, personalized health recommendations based on machine learning risk predictions.

Guidelines:
- Always emphasize the importance of professional medical consultation
- Provide specific, actionable recommendations
- Use current medical best practices and guidelines
- Consider individual risk factors and demographics
- Be clear about limitations and when to seek immediate care
- Focus on preventive measures and lifestyle modifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disease {
    Diabetes,
    Heart,
    Hypertension,
}

impl Disease {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disease::Diabetes => "diabetes",
            Disease::Heart => "heart",
            Disease::Hypertension => "hypertension",
        }
    }

    fn default_confidence(&self) -> f64 {
        match self {
            Disease::Diabetes => 0.85,
            Disease::Heart => 0.88,
            Disease::Hypertension => 0.82,
        }
    }
}

impl fmt::Display for Disease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disease {
    type Err = BloomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "diabetes" => Ok(Disease::Diabetes),
            "heart" => Ok(Disease::Heart),
            "hypertension" => Ok(Disease::Hypertension),
            other => Err(BloomError::Prediction(format!(
                "Unsupported disease type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 70.0 {
            RiskLevel::High
        } else if percentage >= 40.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Intake form values; absent fields take per-model defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PredictionInput {
    pub age: f64,
    pub glucose: Option<f64>,
    pub bmi: Option<f64>,
    pub pregnancies: Option<f64>,
    pub blood_pressure: Option<f64>,
    pub insulin: Option<f64>,
    pub skin_thickness: Option<f64>,
    pub diabetes_pedigree_function: Option<f64>,
    pub sex: Option<f64>,
    pub chest_pain_type: Option<f64>,
    #[serde(rename = "restingBP")]
    pub resting_bp: Option<f64>,
    pub cholesterol: Option<f64>,
    #[serde(rename = "fastingBS")]
    pub fasting_bs: Option<f64>,
    #[serde(rename = "restingECG")]
    pub resting_ecg: Option<f64>,
    #[serde(rename = "maxHR")]
    pub max_hr: Option<f64>,
    pub exercise_angina: Option<f64>,
    pub oldpeak: Option<f64>,
    pub st_slope: Option<f64>,
    #[serde(rename = "systolicBP")]
    pub systolic_bp: Option<f64>,
    #[serde(rename = "diastolicBP")]
    pub diastolic_bp: Option<f64>,
    pub smoking: Option<f64>,
    pub alcohol: Option<f64>,
    pub exercise: Option<f64>,
    pub family_history: Option<f64>,
    pub stress: Option<f64>,
}

impl PredictionInput {
    fn resting_bp_or_default(&self) -> f64 {
        self.resting_bp.or(self.blood_pressure).unwrap_or(120.0)
    }

    fn systolic_or_default(&self) -> f64 {
        self.systolic_bp.or(self.blood_pressure).unwrap_or(120.0)
    }
}

/// Model input in the exact column order each model was trained on.
pub fn feature_vector(disease: Disease, input: &PredictionInput) -> Vec<f64> {
    match disease {
        Disease::Diabetes => vec![
            input.pregnancies.unwrap_or(0.0),
            input.glucose.unwrap_or(0.0),
            input.blood_pressure.unwrap_or(0.0),
            input.skin_thickness.unwrap_or(0.0),
            input.insulin.unwrap_or(0.0),
            input.bmi.unwrap_or(0.0),
            input.diabetes_pedigree_function.unwrap_or(0.0),
            input.age,
        ],
        Disease::Heart => vec![
            input.age,
            input.sex.unwrap_or(1.0),
            input.chest_pain_type.unwrap_or(0.0),
            input.resting_bp_or_default(),
            input.cholesterol.unwrap_or(200.0),
            input.fasting_bs.unwrap_or(0.0),
            input.resting_ecg.unwrap_or(0.0),
            input.max_hr.unwrap_or(150.0),
            input.exercise_angina.unwrap_or(0.0),
            input.oldpeak.unwrap_or(0.0),
            input.st_slope.unwrap_or(1.0),
        ],
        Disease::Hypertension => vec![
            input.age,
            input.systolic_or_default(),
            input.diastolic_bp.unwrap_or(80.0),
            input.bmi.unwrap_or(25.0),
            input.smoking.unwrap_or(0.0),
            input.alcohol.unwrap_or(0.0),
            input.exercise.unwrap_or(0.0),
            input.family_history.unwrap_or(0.0),
            input.stress.unwrap_or(5.0),
        ],
    }
}

fn reported_features(disease: Disease, input: &PredictionInput) -> BTreeMap<String, f64> {
    let pairs: Vec<(&str, f64)> = match disease {
        Disease::Diabetes => vec![
            ("pregnancies", input.pregnancies.unwrap_or(0.0)),
            ("glucose", input.glucose.unwrap_or(0.0)),
            ("bloodPressure", input.blood_pressure.unwrap_or(0.0)),
            ("insulin", input.insulin.unwrap_or(0.0)),
            ("bmi", input.bmi.unwrap_or(0.0)),
            ("age", input.age),
        ],
        Disease::Heart => vec![
            ("age", input.age),
            ("cholesterol", input.cholesterol.unwrap_or(200.0)),
            ("maxHR", input.max_hr.unwrap_or(150.0)),
            ("restingBP", input.resting_bp_or_default()),
        ],
        Disease::Hypertension => vec![
            ("age", input.age),
            ("systolicBP", input.systolic_or_default()),
            ("diastolicBP", input.diastolic_bp.unwrap_or(80.0)),
            ("bmi", input.bmi.unwrap_or(25.0)),
        ],
    };
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub disease: Disease,
    pub risk_percentage: u32,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub features: BTreeMap<String, f64>,
}

/// Rule-based estimate used when the model API is unreachable.
pub fn fallback_prediction(disease: Disease, input: &PredictionInput) -> PredictionResult {
    let mut risk: u32 = 20;
    if input.age > 50.0 {
        risk += 20;
    }
    if input.bmi.is_some_and(|bmi| bmi > 30.0) {
        risk += 15;
    }
    if input.blood_pressure.is_some_and(|bp| bp > 140.0) {
        risk += 15;
    }
    let risk = risk.min(85);

    let features = [
        ("age".to_string(), input.age),
        ("bmi".to_string(), input.bmi.unwrap_or(25.0)),
        ("bloodPressure".to_string(), input.blood_pressure.unwrap_or(120.0)),
    ]
    .into_iter()
    .collect();

    PredictionResult {
        disease,
        risk_percentage: risk,
        risk_level: RiskLevel::from_percentage(risk as f64),
        confidence: 0.75,
        features,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Suggestions {
    pub immediate_actions: Vec<String>,
    pub lifestyle_recommendations: Vec<String>,
    pub medical_advice: Vec<String>,
    pub preventive_measures: Vec<String>,
    pub monitoring_guidelines: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Suggestions {
    /// Generic guidance used when no model is reachable.
    pub fn fallback() -> Self {
        Self {
            immediate_actions: owned(&[
                "Consult with your healthcare provider",
                "Monitor your symptoms daily",
                "Keep a health diary",
                "Take prescribed medications as directed",
            ]),
            lifestyle_recommendations: owned(&[
                "Maintain a balanced, nutritious diet",
                "Exercise regularly (30 minutes daily)",
                "Get adequate sleep (7-9 hours)",
                "Manage stress through relaxation techniques",
                "Avoid smoking and limit alcohol consumption",
            ]),
            medical_advice: owned(&[
                "Schedule regular health checkups",
                "Discuss family history with your doctor",
                "Follow up on recommended screenings",
                "Keep track of vital signs",
            ]),
            preventive_measures: owned(&[
                "Maintain healthy weight",
                "Follow dietary guidelines",
                "Stay physically active",
                "Monitor risk factors regularly",
                "Take preventive medications if prescribed",
            ]),
            monitoring_guidelines: owned(&[
                "Check blood pressure regularly",
                "Monitor weight weekly",
                "Track symptoms in a journal",
                "Follow up with healthcare provider as scheduled",
            ]),
        }
    }

    /// Reads a JSON object embedded in the reply, else `**Section**` bullet lists.
    pub fn parse(content: &str) -> Self {
        static JSON_BLOCK: OnceLock<Regex> = OnceLock::new();
        let json_block = JSON_BLOCK.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("static regex"));

        match json_block.find(content) {
            Some(block) => serde_json::from_str(block.as_str()).unwrap_or_else(|err| {
                warn!(error = %err, "unparseable suggestions JSON");
                Self::default()
            }),
            None => Self {
                immediate_actions: extract_section(content, "Immediate Actions"),
                lifestyle_recommendations: extract_section(content, "Lifestyle Recommendations"),
                medical_advice: extract_section(content, "Medical Advice"),
                preventive_measures: extract_section(content, "Preventive Measures"),
                monitoring_guidelines: extract_section(content, "Monitoring Guidelines"),
            },
        }
    }
}

fn extract_section(content: &str, name: &str) -> Vec<String> {
    static BULLET: OnceLock<Regex> = OnceLock::new();
    let bullet = BULLET.get_or_init(|| Regex::new(r"^(?:-|\d+\.)\s*").expect("static regex"));

    let pattern = format!(r"(?is)\*\*{}\*\*(.*?)(?:\*\*|\z)", regex::escape(name));
    let Ok(section) = Regex::new(&pattern) else {
        return Vec::new();
    };
    let Some(body) = section.captures(content).and_then(|caps| caps.get(1)) else {
        return Vec::new();
    };

    body.as_str()
        .lines()
        .map(str::trim)
        .filter(|line| bullet.is_match(line))
        .map(|line| bullet.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub high: Vec<String>,
    pub moderate: Vec<String>,
    pub low: Vec<String>,
}

pub fn analyze_risk_factors(disease: Disease, input: &PredictionInput) -> RiskFactors {
    let mut factors = RiskFactors::default();
    let above = |value: Option<f64>, limit: f64| value.is_some_and(|v| v > limit);

    match disease {
        Disease::Diabetes => {
            if above(input.glucose, 140.0) {
                factors.high.push("Elevated glucose levels".into());
            }
            if above(input.bmi, 30.0) {
                factors.high.push("Obesity (BMI > 30)".into());
            }
            if input.age > 45.0 {
                factors.moderate.push("Age over 45".into());
            }
            if above(input.blood_pressure, 130.0) {
                factors.moderate.push("High blood pressure".into());
            }
        }
        Disease::Heart => {
            if above(input.cholesterol, 240.0) {
                factors.high.push("High cholesterol".into());
            }
            if input.age > 55.0 {
                factors.high.push("Advanced age".into());
            }
            if above(input.blood_pressure, 140.0) {
                factors.moderate.push("Hypertension".into());
            }
        }
        Disease::Hypertension => {
            if above(input.systolic_bp, 140.0) {
                factors.high.push("High systolic blood pressure".into());
            }
            if above(input.smoking, 0.0) {
                factors.high.push("Smoking habit".into());
            }
            if above(input.bmi, 25.0) {
                factors.moderate.push("Overweight".into());
            }
        }
    }
    factors
}

pub fn next_steps(risk_level: RiskLevel) -> Vec<String> {
    const BASE: [&str; 2] = [
        "Schedule a consultation with your healthcare provider",
        "Share this assessment report with your doctor",
    ];
    let (lead, tail) = match risk_level {
        RiskLevel::High => (
            vec![
                "Seek immediate medical attention",
                "Schedule urgent appointment with specialist",
            ],
            vec![
                "Consider emergency screening if symptoms worsen",
                "Implement immediate lifestyle modifications",
            ],
        ),
        RiskLevel::Medium => (
            vec!["Schedule appointment within 2-4 weeks"],
            vec!["Begin preventive lifestyle changes", "Monitor symptoms closely"],
        ),
        RiskLevel::Low => (
            vec!["Schedule routine checkup"],
            vec!["Maintain healthy lifestyle", "Continue regular monitoring"],
        ),
    };
    lead.into_iter()
        .chain(BASE)
        .chain(tail)
        .map(str::to_string)
        .collect()
}

fn suggestions_prompt(result: &PredictionResult, input: &PredictionInput) -> String {
    let features = result
        .features
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ");
    let level = format!("{:?}", result.risk_level);
    let context = match result.risk_level {
        RiskLevel::High => "requiring immediate attention and intervention",
        RiskLevel::Medium => "requiring proactive management and monitoring",
        RiskLevel::Low => "manageable with preventive measures",
    };
    let disease = result.disease;
    let age = input.age;

    format!(
        r#"MEDICAL RISK ASSESSMENT ANALYSIS

Patient Profile:
- Age: {age} years
- Disease Risk: {disease}
- ML Model Prediction: {risk}% risk ({level} risk level)
- Risk Context: {context}
- Clinical Parameters: {features}

Please provide evidence-based, personalized medical recommendations in JSON format with these exact categories:

{{
  "immediateActions": ["3-4 specific immediate steps for a {level} risk level, with urgency and timeframes"],
  "lifestyleRecommendations": ["4-5 evidence-based lifestyle modifications specific to {disease} prevention"],
  "medicalAdvice": ["3-4 professional guidance points, screenings and consultation urgency"],
  "preventiveMeasures": ["4-5 prevention strategies targeting modifiable risk factors"],
  "monitoringGuidelines": ["3-4 metrics to track, with frequency and target ranges"]
}}

Always emphasize the importance of healthcare provider consultation and keep recommendations age-appropriate for a {age}-year-old patient."#,
        risk = result.risk_percentage,
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedPrediction {
    #[serde(flatten)]
    pub prediction: PredictionResult,
    pub llm_suggestions: Suggestions,
    pub risk_factors: RiskFactors,
    pub next_steps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelReply {
    probability: f64,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct PredictionClient {
    http: reqwest::Client,
    base_url: String,
    gateway: Option<Arc<LlmGateway>>,
    telemetry: Option<TelemetryCollector>,
}

impl PredictionClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| BloomError::Prediction(format!("http client error: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gateway: None,
            telemetry: None,
        })
    }

    pub fn from_config(cfg: &PredictionConfig) -> Result<Self> {
        Self::new(cfg.api_base_url.clone())
    }

    pub fn with_gateway(mut self, gateway: Arc<LlmGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    async fn request(&self, disease: Disease, input: &PredictionInput) -> Result<ModelReply> {
        let resp = self
            .http
            .post(format!("{}/predict/{}", self.base_url, disease))
            .json(&json!({ "features": feature_vector(disease, input) }))
            .send()
            .await
            .map_err(|err| BloomError::Prediction(format!("request error: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BloomError::Prediction(format!(
                "HTTP error! status: {}",
                status.as_u16()
            )));
        }
        resp.json()
            .await
            .map_err(|err| BloomError::Prediction(format!("response parse error: {err}")))
    }

    /// Never fails: API errors yield the rule-based estimate.
    pub async fn predict(&self, disease: Disease, input: &PredictionInput) -> PredictionResult {
        match self.request(disease, input).await {
            Ok(reply) => {
                let percentage = reply.probability * 100.0;
                debug!(%disease, percentage, "model prediction received");
                PredictionResult {
                    disease,
                    risk_percentage: percentage.round().clamp(0.0, 100.0) as u32,
                    risk_level: RiskLevel::from_percentage(percentage),
                    confidence: reply.confidence.unwrap_or_else(|| disease.default_confidence()),
                    features: reported_features(disease, input),
                }
            }
            Err(err) => {
                warn!(%disease, error = %err, "prediction API unavailable, using rule-based estimate");
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_failure(format!("predict:{disease}"), err.to_string(), 0);
                    telemetry.record("fallback_used", json!({ "stage": "rule_based_prediction" }));
                }
                fallback_prediction(disease, input)
            }
        }
    }

    async fn suggestions(&self, result: &PredictionResult, input: &PredictionInput) -> Suggestions {
        let Some(gateway) = &self.gateway else {
            return Suggestions::fallback();
        };
        let messages = vec![
            ConversationMessage::system(SUGGESTIONS_SYSTEM_PROMPT),
            ConversationMessage::user(suggestions_prompt(result, input)),
        ];
        match gateway
            .generate_response(&messages, &GenerationOptions::new(0.1, 2000))
            .await
        {
            Ok(response) => Suggestions::parse(&response.content),
            Err(err) => {
                warn!(error = %err, "suggestion generation failed, using generic guidance");
                Suggestions::fallback()
            }
        }
    }

    pub async fn enhanced_prediction(
        &self,
        disease: Disease,
        input: &PredictionInput,
    ) -> EnhancedPrediction {
        let prediction = self.predict(disease, input).await;
        let llm_suggestions = self.suggestions(&prediction, input).await;
        EnhancedPrediction {
            risk_factors: analyze_risk_factors(disease, input),
            next_steps: next_steps(prediction.risk_level),
            prediction,
            llm_suggestions,
        }
    }
}
