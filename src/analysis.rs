//! Single-shot medical image analysis.
//!
//! One HTTPS request to the hosted content API with the image inline and a
//! fixed prompt; the model answers with a structured JSON report. The voice
//! session only consumes the report shape to seed its system instruction —
//! the model's reasoning is entirely upstream.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;

const ANALYSIS_PROMPT: &str = "You are a medical imaging assistant. Describe this image for a \
patient in plain language. Reply with JSON only, matching: {\"summary\": string, \
\"keyInsights\": [string], \"diagnoses\": [{\"condition\": string, \"confidence\": \
\"High\"|\"Medium\"|\"Low\"|\"Uncertain\", \"severity\": \
\"Critical\"|\"Moderate\"|\"Mild\"|\"Unknown\", \"suggestion\": string}]}. \
Do not add a preamble or markdown fences.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Moderate,
    Mild,
    Unknown,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
            Confidence::Uncertain => "uncertain",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::Moderate => "moderate",
            Severity::Mild => "mild",
            Severity::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub condition: String,
    pub confidence: Confidence,
    pub severity: Severity,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub summary: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub diagnoses: Vec<Diagnosis>,
}

impl AnalysisReport {
    /// Render the report as prose the assistant can narrate, rather than a
    /// data structure it would read out loud.
    pub fn narration(&self) -> String {
        let mut out = format!("Image analysis summary: {}", self.summary);
        for d in &self.diagnoses {
            out.push_str(&format!(
                " Possible finding: {} ({} confidence, {} severity). Suggested next step: {}",
                d.condition, d.confidence, d.severity, d.suggestion
            ));
        }
        if !self.key_insights.is_empty() {
            out.push_str(" Key points: ");
            out.push_str(&self.key_insights.join("; "));
            out.push('.');
        }
        out
    }
}

pub struct AnalysisClient {
    http: Client,
    api_endpoint: String,
    model: String,
    api_key: String,
}

impl AnalysisClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: Client::new(),
            api_endpoint: config.api_endpoint.clone(),
            model: config.analysis_model.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// Submit one image and parse the structured report out of the reply.
    pub async fn analyze_image(&self, image: &[u8], mime_type: &str) -> anyhow::Result<AnalysisReport> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_endpoint, self.model, self.api_key
        );
        let body = json!({
            "contents": [{
                "parts": [
                    { "inlineData": { "mimeType": mime_type, "data": BASE64.encode(image) } },
                    { "text": ANALYSIS_PROMPT }
                ]
            }],
            "generationConfig": { "responseMimeType": "application/json" }
        });

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("analysis request failed: HTTP {status}");
        }

        let reply: serde_json::Value = response.json().await?;
        let text = reply["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("analysis reply carried no text part"))?;

        parse_report(text)
    }
}

/// Parse the model's JSON reply, tolerating markdown code fences.
fn parse_report(text: &str) -> anyhow::Result<AnalysisReport> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    Ok(serde_json::from_str(trimmed)?)
}

/// Guess the upload mime type from a file extension.
pub fn mime_for_path(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> AnalysisReport {
        AnalysisReport {
            summary: "Mild soft-tissue swelling, no fracture visible.".into(),
            key_insights: vec!["Bone alignment is normal".into()],
            diagnoses: vec![Diagnosis {
                condition: "Soft tissue contusion".into(),
                confidence: Confidence::Medium,
                severity: Severity::Mild,
                suggestion: "Rest and ice; see a doctor if pain persists".into(),
            }],
        }
    }

    #[test]
    fn report_parses_from_camel_case_json() {
        let raw = r#"{
            "summary": "No acute findings.",
            "keyInsights": ["Clear lung fields"],
            "diagnoses": [{
                "condition": "Normal study",
                "confidence": "High",
                "severity": "Unknown",
                "suggestion": "No follow-up needed"
            }]
        }"#;
        let report = parse_report(raw).unwrap();
        assert_eq!(report.key_insights.len(), 1);
        assert_eq!(report.diagnoses[0].confidence, Confidence::High);
        assert_eq!(report.diagnoses[0].severity, Severity::Unknown);
    }

    #[test]
    fn report_parses_inside_code_fences() {
        let raw = "```json\n{\"summary\": \"ok\"}\n```";
        let report = parse_report(raw).unwrap();
        assert_eq!(report.summary, "ok");
        assert!(report.diagnoses.is_empty());
    }

    #[test]
    fn unknown_confidence_is_rejected() {
        let raw = r#"{"summary":"x","diagnoses":[{"condition":"c","confidence":"Definite","severity":"Mild","suggestion":"s"}]}"#;
        assert!(parse_report(raw).is_err());
    }

    #[test]
    fn narration_reads_as_prose() {
        let narration = sample_report().narration();
        assert!(narration.contains("Mild soft-tissue swelling"));
        assert!(narration.contains("medium confidence"));
        assert!(narration.contains("mild severity"));
        assert!(narration.contains("Bone alignment is normal"));
    }

    #[test]
    fn mime_guessing_defaults_to_jpeg() {
        use std::path::Path;
        assert_eq!(mime_for_path(Path::new("scan.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("scan.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("scan")), "image/jpeg");
    }
}
