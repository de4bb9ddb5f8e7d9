//! Bounded LLM tie-breaking.
//!
//! Invoked only when the deterministic top-2 gap is inside the ambiguity
//! epsilon, with a compact prompt carrying exactly the top two candidates.
//! The call is wrapped in a hard timeout; on failure or timeout the
//! deterministic top-1 stands and the caller records TIE_BREAK_FALLBACK.

use std::time::Duration;

use async_trait::async_trait;
use ovs_schemas::OvsError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::CandidateScore;

/// Which of the two candidates the tie-breaker picked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TieBreakChoice {
    /// Index into the pair handed over: 0 or 1.
    pub winner: usize,
    pub rationale: String,
}

#[async_trait]
pub trait TieBreaker: Send + Sync {
    async fn break_tie(
        &self,
        intent: &str,
        top_two: [&CandidateScore; 2],
    ) -> Result<TieBreakChoice, OvsError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation against the configured LLM endpoint
// ---------------------------------------------------------------------------

pub struct HttpTieBreaker {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct TieBreakResponse {
    winner: usize,
    #[serde(default)]
    rationale: String,
}

impl HttpTieBreaker {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction must not fail");
        Self { client, url }
    }
}

#[async_trait]
impl TieBreaker for HttpTieBreaker {
    async fn break_tie(
        &self,
        intent: &str,
        top_two: [&CandidateScore; 2],
    ) -> Result<TieBreakChoice, OvsError> {
        let body = json!({
            "intent": intent,
            "candidates": top_two.iter().map(|c| json!({
                "tool": c.tool_name,
                "pattern": c.pattern,
                "score": c.score,
                "features": c.features,
            })).collect::<Vec<_>>(),
            "instruction": "Pick the better candidate for the intent. \
                            Respond as {\"winner\": 0|1, \"rationale\": \"...\"}.",
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OvsError::timeout("tie-break call timed out")
                } else {
                    OvsError::transient(format!("tie-break call failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            return Err(OvsError::transient(format!(
                "tie-break endpoint returned {}",
                resp.status()
            )));
        }

        let parsed: TieBreakResponse = resp
            .json()
            .await
            .map_err(|e| OvsError::transient(format!("tie-break response malformed: {e}")))?;

        if parsed.winner > 1 {
            return Err(OvsError::transient(format!(
                "tie-break winner index {} out of range",
                parsed.winner
            )));
        }

        Ok(TieBreakChoice {
            winner: parsed.winner,
            rationale: parsed.rationale,
        })
    }
}
