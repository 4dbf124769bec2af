//! Feature wrappers over [`StreamingController`].
//!
//! Each feature fixes a panel id, the tools it may call, a default character
//! and the structured fields it keeps from a completion.

use std::marker::PhantomData;
use std::ops::Deref;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::StreamingContext;
use crate::controller::{select_fields, ControllerOptions, StreamingController};
use crate::error::ClientError;

pub trait Feature {
    const PANEL_ID: &'static str;
    const TOOLS: &'static [&'static str];
    const FIELDS: &'static [&'static str];
    const CHARACTER_ID: &'static str;

    type Structured: DeserializeOwned;
}

/// Score-style analysis shared by the content, headline and profile features
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisScore {
    pub score: Option<f64>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub improvements: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileAnalysisResult {
    #[serde(flatten)]
    pub analysis: AnalysisScore,
    pub sections: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalDraft {
    pub title: String,
    pub summary: String,
    pub sections: Vec<Value>,
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViralPostDraft {
    pub hook: String,
    pub body: String,
    pub hashtags: Vec<String>,
    pub viral_score: Option<f64>,
}

const SCORE_FIELDS: &[&str] = &["score", "strengths", "weaknesses", "improvements"];

pub struct ContentAnalysisFeature;
pub struct HeadlineFeature;
pub struct ProfileFeature;
pub struct ProposalFeature;
pub struct ViralPostFeature;

impl Feature for ContentAnalysisFeature {
    const PANEL_ID: &'static str = "content_analysis";
    const TOOLS: &'static [&'static str] = &["analyze_content"];
    const FIELDS: &'static [&'static str] = SCORE_FIELDS;
    const CHARACTER_ID: &'static str = "content_analyst";
    type Structured = AnalysisScore;
}

impl Feature for HeadlineFeature {
    const PANEL_ID: &'static str = "headline_analyzer";
    const TOOLS: &'static [&'static str] = &["analyze_headline", "generate_headline"];
    const FIELDS: &'static [&'static str] = SCORE_FIELDS;
    const CHARACTER_ID: &'static str = "headline_expert";
    type Structured = AnalysisScore;
}

impl Feature for ProfileFeature {
    const PANEL_ID: &'static str = "profile_optimizer";
    const TOOLS: &'static [&'static str] = &["analyze_profile", "optimize_profile"];
    const FIELDS: &'static [&'static str] =
        &["score", "strengths", "weaknesses", "improvements", "sections"];
    const CHARACTER_ID: &'static str = "profile_coach";
    type Structured = ProfileAnalysisResult;
}

impl Feature for ProposalFeature {
    const PANEL_ID: &'static str = "proposal_wizard";
    const TOOLS: &'static [&'static str] = &["generate_proposal", "refine_proposal"];
    const FIELDS: &'static [&'static str] = &["title", "summary", "sections", "next_steps"];
    const CHARACTER_ID: &'static str = "proposal_writer";
    type Structured = ProposalDraft;
}

impl Feature for ViralPostFeature {
    const PANEL_ID: &'static str = "viral_post_generator";
    const TOOLS: &'static [&'static str] = &["generate_viral_post", "analyze_viral_potential"];
    const FIELDS: &'static [&'static str] = &["hook", "body", "hashtags", "viral_score"];
    const CHARACTER_ID: &'static str = "viral_strategist";
    type Structured = ViralPostDraft;
}

pub type ContentAnalysis = FeatureController<ContentAnalysisFeature>;
pub type HeadlineAnalysis = FeatureController<HeadlineFeature>;
pub type ProfileAnalysis = FeatureController<ProfileFeature>;
pub type ProposalAssistant = FeatureController<ProposalFeature>;
pub type ViralPost = FeatureController<ViralPostFeature>;

/// A [`StreamingController`] preconfigured for feature `F`.
///
/// Derefs to the controller for the generic operations (`reset`,
/// `snapshot`, `send_follow_up_message`, ...).
pub struct FeatureController<F: Feature> {
    controller: StreamingController,
    _feature: PhantomData<fn() -> F>,
}

impl<F: Feature> Clone for FeatureController<F> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            _feature: PhantomData,
        }
    }
}

impl<F: Feature> FeatureController<F> {
    pub fn new(ctx: StreamingContext) -> Self {
        Self::with_character(ctx, F::CHARACTER_ID)
    }

    pub fn with_character(ctx: StreamingContext, character_id: impl Into<String>) -> Self {
        Self::with_options(ctx, Self::options(character_id))
    }

    /// Build from caller-tuned options (callbacks, metadata). Panel, tools
    /// and mapper are always the feature's own.
    pub fn with_options(ctx: StreamingContext, options: ControllerOptions) -> Self {
        let options = ControllerOptions {
            panel_id: F::PANEL_ID.to_string(),
            supported_tools: F::TOOLS.iter().map(|t| t.to_string()).collect(),
            structured_mapper: Some(select_fields(F::FIELDS)),
            ..options
        };
        Self {
            controller: StreamingController::new(ctx, options),
            _feature: PhantomData,
        }
    }

    /// Default options for this feature, to be extended before
    /// [`with_options`](Self::with_options).
    pub fn options(character_id: impl Into<String>) -> ControllerOptions {
        ControllerOptions::new(F::PANEL_ID, character_id, F::TOOLS.iter().copied())
            .with_mapper(select_fields(F::FIELDS))
    }

    pub fn controller(&self) -> &StreamingController {
        &self.controller
    }

    /// The last completion's structured result, typed.
    pub fn structured(&self) -> Result<Option<F::Structured>, serde_json::Error> {
        self.controller
            .snapshot()
            .structured_analysis
            .map(serde_json::from_value)
            .transpose()
    }
}

impl<F: Feature> Deref for FeatureController<F> {
    type Target = StreamingController;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}

fn arguments(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl ContentAnalysis {
    pub async fn analyze_content(
        &self,
        content: &str,
        content_type: Option<&str>,
    ) -> Result<String, ClientError> {
        let mut args = arguments(json!({ "content": content }));
        if let Some(content_type) = content_type {
            args.insert("content_type".into(), json!(content_type));
        }
        self.controller.invoke_tool("analyze_content", args).await
    }
}

impl HeadlineAnalysis {
    pub async fn analyze_headline(
        &self,
        headline: &str,
        platform: &str,
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "headline": headline, "platform": platform }));
        self.controller.invoke_tool("analyze_headline", args).await
    }

    pub async fn generate_headline(
        &self,
        topic: &str,
        platform: &str,
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "topic": topic, "platform": platform }));
        self.controller.invoke_tool("generate_headline", args).await
    }
}

impl ProfileAnalysis {
    pub async fn analyze_profile(
        &self,
        profile: &str,
        platform: &str,
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "profile": profile, "platform": platform }));
        self.controller.invoke_tool("analyze_profile", args).await
    }

    pub async fn optimize_profile(
        &self,
        profile: &str,
        goals: &[String],
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "profile": profile, "goals": goals }));
        self.controller.invoke_tool("optimize_profile", args).await
    }
}

impl ProposalAssistant {
    pub async fn generate_proposal(
        &self,
        client: &str,
        requirements: &str,
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "client": client, "requirements": requirements }));
        self.controller.invoke_tool("generate_proposal", args).await
    }

    pub async fn refine_proposal(&self, feedback: &str) -> Result<String, ClientError> {
        let mut args = arguments(json!({ "feedback": feedback }));
        if let Some(previous) = self.controller.snapshot().structured_analysis {
            args.insert("proposal".into(), previous);
        }
        self.controller.invoke_tool("refine_proposal", args).await
    }
}

impl ViralPost {
    pub async fn generate_viral_post(
        &self,
        topic: &str,
        platform: &str,
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "topic": topic, "platform": platform }));
        self.controller.invoke_tool("generate_viral_post", args).await
    }

    pub async fn analyze_viral_potential(
        &self,
        post: &str,
        platform: &str,
    ) -> Result<String, ClientError> {
        let args = arguments(json!({ "post": post, "platform": platform }));
        self.controller.invoke_tool("analyze_viral_potential", args).await
    }
}
