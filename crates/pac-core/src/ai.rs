//! Failure analysis through an OpenAI-compatible chat completion API.

use serde::{Deserialize, Serialize};

use crate::db::{DbPool, SecretRepo};
use crate::error::{PacError, Result};
use crate::models::{AiAnalysis, AiRole, PipelineRun, Repository};
use crate::providers::send_json;
use crate::redact::Redactor;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TOKEN_KEY: &str = "token";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

/// One comment to post per configured role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub role: String,
    pub body: String,
}

/// Marker of the analysis comment of a role, for the update strategy.
pub fn analysis_marker(role: &str, original_prname: &str) -> String {
    format!("<!-- pac-ai-{}-{} -->", role, original_prname)
}

pub struct AiAnalyzer {
    client: reqwest::Client,
}

impl AiAnalyzer {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// The analysis settings of `repo` when they apply.
    pub fn settings(repo: &Repository) -> Option<AiAnalysis> {
        repo.settings()
            .ai_analysis
            .filter(|ai| ai.enabled && !ai.roles.is_empty())
    }

    /// Runs every role against the failed run and returns the comment bodies.
    ///
    /// A role whose request fails is logged and skipped.
    pub async fn analyze(
        &self,
        pool: &DbPool,
        repo: &Repository,
        settings: &AiAnalysis,
        run: &PipelineRun,
        redactor: &Redactor,
    ) -> Result<Vec<Analysis>> {
        let api_url = match (settings.api_url.as_deref(), settings.provider.as_str()) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, "" | "openai") => OPENAI_API_URL.to_string(),
            (None, other) => {
                return Err(PacError::Configuration(format!(
                    "ai_analysis provider {} needs an api_url",
                    other
                )));
            }
        };
        let token = match &settings.token_secret_ref {
            Some(secret) => Some(
                SecretRepo::get_value(
                    pool,
                    &repo.namespace,
                    &secret.name,
                    secret.key_or(DEFAULT_TOKEN_KEY),
                )
                .await?,
            ),
            None => None,
        };

        let context = redactor.redact(&failure_context(run));
        let mut analyses = Vec::new();
        for role in &settings.roles {
            match self.ask(&api_url, token.as_deref(), role, &context).await {
                Ok(answer) if !answer.trim().is_empty() => analyses.push(Analysis {
                    role: role.name.clone(),
                    body: format!(
                        "{}\n### 🤖 AI analysis: {}\n\n{}\n",
                        analysis_marker(&role.name, &run.original_prname),
                        role.name,
                        redactor.redact(answer.trim())
                    ),
                }),
                Ok(_) => tracing::info!("AI role {} returned an empty answer for {}", role.name, run.key()),
                Err(e) => tracing::warn!("AI role {} failed for {}: {}", role.name, run.key(), e),
            }
        }
        Ok(analyses)
    }

    async fn ask(&self, api_url: &str, token: Option<&str>, role: &AiRole, context: &str) -> Result<String> {
        let request = ChatRequest {
            model: role.model.as_deref().unwrap_or(DEFAULT_MODEL),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: role.prompt.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: context.to_string(),
                },
            ],
        };
        let url = format!("{}/chat/completions", api_url);
        let response: ChatResponse = send_json("AI analysis", || {
            let builder = self.client.post(&url).json(&request);
            match token {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            }
        })
        .await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}

fn failure_context(run: &PipelineRun) -> String {
    let mut context = format!(
        "PipelineRun {} ({}) failed on commit {} for event {}.\n",
        run.name, run.original_prname, run.sha, run.event_type
    );
    if let Some(branch) = &run.target_branch {
        context.push_str(&format!("Target branch: {}\n", branch));
    }
    if let Some(message) = &run.message {
        context.push_str(&format!("Failure message:\n{}\n", message));
    }
    context.push_str(&format!("\nPipelineRun definition:\n{}\n", run.body));
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Settings;

    #[test]
    fn test_settings_requires_enabled_roles() {
        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        assert!(AiAnalyzer::settings(&repo).is_none());

        repo.spec.settings = Some(Settings {
            ai_analysis: Some(AiAnalysis {
                enabled: true,
                provider: "openai".into(),
                api_url: None,
                token_secret_ref: None,
                roles: vec![],
            }),
            ..Default::default()
        });
        assert!(AiAnalyzer::settings(&repo).is_none());

        if let Some(ai) = repo.spec.settings.as_mut().and_then(|s| s.ai_analysis.as_mut()) {
            ai.roles.push(AiRole {
                name: "triage".into(),
                prompt: "Explain the failure".into(),
                model: None,
            });
        }
        assert!(AiAnalyzer::settings(&repo).is_some());
    }

    #[test]
    fn test_chat_response_shape() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Missing dependency"}}]}"#,
        )
        .unwrap();
        assert_eq!(response.choices[0].message.content, "Missing dependency");
    }
}
