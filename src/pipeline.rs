use crate::catalog::ProductRecord;
use crate::config::Settings;
use crate::extract::{ExtractionConfig, ExtractionEngine, ExtractionRun, ProgressSink};
use crate::http::build_client;
use crate::llm::{ChatModel, TensorZeroClient, TensorZeroConfig};
use crate::matcher::{CategoryMatch, CategoryMatcher, Confidence, MatchError, MatcherConfig};
use crate::models::{
    ApiError, BatchGroupOutcome, BatchRunRequest, BatchRunResponse, ExtractRequest,
    ExtractResponse, GroupRunRequest, GroupRunResponse, MatchRequest, MatchResponse,
    ReconcileRequest, ReconcileResponse, StageReport,
};
use crate::reconcile::{self, EditedRecord, KeyMap, UploadPayload};
use crate::store::{MatchStore, MemoryMatchStore, RedisMatchStore};
use crate::taxonomy::schema::{self, ResolvedSchema, SchemaError};
use crate::taxonomy::{TaxonomyError, TaxonomyIndex};
use chrono::Utc;
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Borrow attribute definitions from the nearest ancestor when the
    /// matched category has none.
    pub inherit_schema: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inherit_schema: true,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    index: Arc<TaxonomyIndex>,
    matcher: Arc<CategoryMatcher>,
    extractor: ExtractionEngine,
    store: Arc<dyn MatchStore>,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(
        index: Arc<TaxonomyIndex>,
        matcher: CategoryMatcher,
        extractor: ExtractionEngine,
        store: Arc<dyn MatchStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            index,
            matcher: Arc::new(matcher),
            extractor,
            store,
            config: Arc::new(config),
        }
    }

    pub fn from_settings(settings: &Settings, index: Arc<TaxonomyIndex>) -> Self {
        let http = build_client(settings.http_timeout, settings.http_connect_timeout);
        let match_llm: Arc<dyn ChatModel> = Arc::new(TensorZeroClient::new(
            http.clone(),
            TensorZeroConfig::for_function(&settings.llm, &settings.llm.match_function),
        ));
        let extract_llm: Arc<dyn ChatModel> = Arc::new(TensorZeroClient::new(
            http,
            TensorZeroConfig::for_function(&settings.llm, &settings.llm.extract_function),
        ));

        let matcher = CategoryMatcher::new(
            index.clone(),
            match_llm,
            MatcherConfig {
                sample_size: settings.match_sample_size,
                candidates: settings.match_candidates,
                min_confidence: settings.match_min_confidence,
            },
        );
        let extractor = ExtractionEngine::new(
            extract_llm,
            ExtractionConfig {
                concurrency: settings.extract_concurrency,
                request_timeout: settings.llm_request_timeout,
            },
        );

        let redis = settings
            .redis_url
            .as_deref()
            .and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(target = "metafield.api", error = %err, "invalid REDIS_URL; using in-memory match store");
                    None
                }
            });
        let store: Arc<dyn MatchStore> = match redis {
            Some(client) => Arc::new(RedisMatchStore::new(client, settings.match_cache_ttl_secs)),
            None => Arc::new(MemoryMatchStore::default()),
        };

        Self::new(
            index,
            matcher,
            extractor,
            store,
            PipelineConfig {
                inherit_schema: settings.schema_inherit_from_ancestors,
            },
        )
    }

    pub fn taxonomy(&self) -> &TaxonomyIndex {
        &self.index
    }

    pub fn schema_for(&self, category_id: &str) -> Result<ResolvedSchema, PipelineError> {
        self.stage_schema(category_id).map(|outcome| outcome.value)
    }

    pub async fn match_group(&self, request: MatchRequest) -> Result<MatchResponse, PipelineError> {
        let tag = validate_tag(&request.tag)?;
        let outcome = self
            .stage_match(tag, &request.products, request.refresh)
            .await?;
        Ok(outcome.value)
    }

    /// Extraction for a category the caller already knows.
    pub async fn extract(&self, request: ExtractRequest) -> Result<ExtractResponse, PipelineError> {
        let schema = self.schema_for(&request.category_id)?;
        let run = self
            .extractor
            .run(&request.products, &schema.source_path, &schema.attributes, None)
            .await;
        let upload =
            reconcile::upload_payload_from_results(&run.results, &KeyMap::build(&schema.attributes));
        Ok(ExtractResponse {
            schema,
            run,
            upload,
        })
    }

    /// match → resolve schema → extract → upload payload, with a stage
    /// report per step.
    pub async fn run_group(
        &self,
        request: GroupRunRequest,
        progress: Option<ProgressSink>,
    ) -> Result<GroupRunResponse, PipelineError> {
        let tag = validate_tag(&request.tag)?.to_string();
        if request.products.is_empty() {
            return Err(PipelineError::invalid_input(
                "match_category",
                "group has no products",
            ));
        }
        let overrides = request.overrides.clone().unwrap_or_default();
        let mut stages = Vec::new();

        let category_match = if let Some(category_id) = overrides.category_id.as_deref() {
            self.capture_stage("match_category", &mut stages, async {
                self.stage_override(&tag, category_id)
            })
            .await?
        } else {
            self.capture_stage(
                "match_category",
                &mut stages,
                self.stage_match(&tag, &request.products, overrides.refresh_match),
            )
            .await?
            .category_match
        };

        let schema = self
            .capture_stage("resolve_schema", &mut stages, async {
                self.stage_schema(&category_match.node.id)
            })
            .await?;

        let run = self
            .capture_stage(
                "extract_attributes",
                &mut stages,
                self.stage_extract(&request.products, &schema, progress),
            )
            .await?;

        let upload = self
            .capture_stage("build_payload", &mut stages, async {
                stage_payload(&run, &schema)
            })
            .await?;

        Ok(GroupRunResponse {
            tag,
            category_match,
            schema,
            run,
            upload,
            stages,
        })
    }

    /// Runs groups one after another. A failing group is reported and the
    /// batch moves on.
    pub async fn run_batch(&self, request: BatchRunRequest) -> BatchRunResponse {
        let mut response = BatchRunResponse {
            succeeded: 0,
            failed: 0,
            groups: Vec::with_capacity(request.groups.len()),
        };
        for group in request.groups {
            let tag = group.tag.clone();
            match self.run_group(group, None).await {
                Ok(result) => {
                    response.succeeded += 1;
                    response.groups.push(BatchGroupOutcome {
                        tag,
                        result: Some(result),
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(
                        target = "metafield.api",
                        tag = %tag,
                        stage = err.stage(),
                        error = %err,
                        "group failed in batch"
                    );
                    response.failed += 1;
                    response.groups.push(BatchGroupOutcome {
                        tag,
                        result: None,
                        error: Some(err.to_api_error()),
                    });
                }
            }
        }
        response
    }

    pub fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResponse, PipelineError> {
        let defs = match request.category_id.as_deref() {
            Some(category_id) => Some(self.schema_for(category_id)?.attributes),
            None => None,
        };
        let keys = defs.as_deref().map(KeyMap::build).unwrap_or_default();

        let mut edited = request.edited;
        edited.extend(request.rows.iter().filter_map(EditedRecord::from_row));
        if edited.is_empty() {
            return Err(PipelineError::invalid_input(
                "reconcile",
                "no edited records or rows supplied",
            ));
        }

        let outcome = reconcile::resync(&edited, &request.canonical, &keys, defs.as_deref());
        let upload = reconcile::upload_payload(&outcome.records);
        let display = request
            .include_display
            .then(|| reconcile::display_rows(&outcome.records, &keys));
        Ok(ReconcileResponse {
            records: outcome.records,
            report: outcome.report,
            upload,
            display,
        })
    }

    async fn stage_match(
        &self,
        tag: &str,
        products: &[ProductRecord],
        refresh: bool,
    ) -> Result<StageOutcome<MatchResponse>, PipelineError> {
        if !refresh
            && let Some(stored) = self.store.get(tag).await
        {
            // A snapshot reload may have dropped the stored node.
            if self.index.lookup_by_id(&stored.node.id).is_ok() {
                crate::metrics::group_matched(true);
                let output = match_output(&stored, "store");
                return Ok(StageOutcome::new(
                    MatchResponse {
                        category_match: stored,
                        cached: true,
                    },
                    output,
                ));
            }
        }

        let found = self
            .matcher
            .match_group(tag, products)
            .await
            .map_err(PipelineError::from_match)?;
        self.store.put(&found).await;
        crate::metrics::group_matched(false);
        let output = match_output(&found, "model");
        Ok(StageOutcome::new(
            MatchResponse {
                category_match: found,
                cached: false,
            },
            output,
        ))
    }

    fn stage_override(
        &self,
        tag: &str,
        category_id: &str,
    ) -> Result<StageOutcome<CategoryMatch>, PipelineError> {
        let node = self
            .index
            .lookup_by_id(category_id)
            .map_err(|err| PipelineError::from_taxonomy("match_category", err))?;
        let category_match = CategoryMatch {
            tag: tag.to_string(),
            node: node.clone(),
            confidence: Confidence::High,
            reasoning: "category supplied by caller".into(),
            sample_size: 0,
            candidate_count: 0,
            matched_at: Utc::now(),
        };
        let output = match_output(&category_match, "override");
        Ok(StageOutcome::new(category_match, output))
    }

    fn stage_schema(&self, category_id: &str) -> Result<StageOutcome<ResolvedSchema>, PipelineError> {
        let node = self
            .index
            .lookup_by_id(category_id)
            .map_err(|err| PipelineError::from_taxonomy("resolve_schema", err))?;
        let resolved = if self.config.inherit_schema {
            schema::resolve_inherited(&self.index, node)
        } else {
            schema::resolve_direct(node)
        }
        .map_err(PipelineError::from_schema)?;

        let output = json!({
            "category_id": resolved.category_id,
            "source_id": resolved.source_id,
            "inherited": resolved.inherited,
            "attributes": resolved.attributes.len(),
            "keys": resolved.attributes.iter().map(|def| def.key.as_str()).collect::<Vec<_>>(),
        });
        Ok(StageOutcome::new(resolved, output))
    }

    async fn stage_extract(
        &self,
        products: &[ProductRecord],
        schema: &ResolvedSchema,
        progress: Option<ProgressSink>,
    ) -> Result<StageOutcome<ExtractionRun>, PipelineError> {
        let run = self
            .extractor
            .run(products, &schema.source_path, &schema.attributes, progress)
            .await;
        let output = json!({
            "products": run.results.len(),
            "failures": run.failures,
            "failed_product_ids": run.failed_product_ids,
            "filled_fields": run.filled_fields,
            "products_with_values": run.products_with_values,
        });
        if !run.results.is_empty() && run.failures == run.results.len() {
            warn!(
                target = "metafield.extract",
                products = run.results.len(),
                "every product failed extraction"
            );
        }
        Ok(StageOutcome::new(run, output))
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        info!(target = "metafield.api", stage = name, elapsed_ms = elapsed_ms as u64, "stage completed");
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn stage_payload(
    run: &ExtractionRun,
    schema: &ResolvedSchema,
) -> Result<StageOutcome<UploadPayload>, PipelineError> {
    let upload =
        reconcile::upload_payload_from_results(&run.results, &KeyMap::build(&schema.attributes));
    let output = json!({
        "products": upload.products.len(),
        "values": upload.products.values().map(|values| values.len()).sum::<usize>(),
        "issues": upload.issues.len(),
    });
    Ok(StageOutcome::new(upload, output))
}

fn match_output(category_match: &CategoryMatch, source: &str) -> Value {
    json!({
        "category_id": category_match.node.id,
        "category": category_match.node.full_path,
        "confidence": category_match.confidence,
        "reasoning": category_match.reasoning,
        "candidates": category_match.candidate_count,
        "source": source,
    })
}

fn validate_tag(raw: &str) -> Result<&str, PipelineError> {
    let tag = raw.trim();
    if tag.is_empty() {
        return Err(PipelineError::invalid_input("match_category", "tag is required"));
    }
    Ok(tag)
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Unprocessable,
    Internal,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn unprocessable(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Unprocessable)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn from_taxonomy(stage: &'static str, err: TaxonomyError) -> Self {
        let message = err.to_string();
        match err {
            TaxonomyError::NotFound(_) => Self::not_found(stage, message),
            _ => Self::internal(stage, message),
        }
    }

    fn from_schema(err: SchemaError) -> Self {
        Self::unprocessable("resolve_schema", err.to_string())
    }

    fn from_match(err: MatchError) -> Self {
        let message = err.to_string();
        match err {
            MatchError::Llm(_) => Self::internal("match_category", message),
            _ => Self::unprocessable("match_category", message),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            error: self.stage.to_string(),
            detail: Some(self.message.clone()),
        }
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedModel};
    use crate::models::GroupOverrides;
    use crate::taxonomy::index::tests::tv_index;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TV_MATCH: &str =
        r#"{"category_id": "1", "confidence": "high", "reasoning": "televisions"}"#;
    const TV_VALUES: &str =
        r#"{"metafields": {"display-resolution": "3840x2160", "screen-size": "55 in"}}"#;

    pub(crate) fn pipeline_with(
        match_model: Arc<ScriptedModel>,
        extract_model: Arc<ScriptedModel>,
    ) -> Pipeline {
        let index = Arc::new(tv_index());
        let matcher = CategoryMatcher::new(index.clone(), match_model, MatcherConfig::default());
        let extractor = ExtractionEngine::new(
            extract_model,
            ExtractionConfig {
                concurrency: 3,
                request_timeout: Duration::from_secs(5),
            },
        );
        Pipeline::new(
            index,
            matcher,
            extractor,
            Arc::new(MemoryMatchStore::default()),
            PipelineConfig::default(),
        )
    }

    pub(crate) fn tv_products(n: usize) -> Vec<ProductRecord> {
        (0..n)
            .map(|i| ProductRecord {
                id: format!("tv-{i}"),
                title: format!("Acme 55 inch 4K Smart TV model {i}"),
                description_html: Some("<p>3840x2160 resolution</p>".into()),
                ..Default::default()
            })
            .collect()
    }

    fn group(tag: &str, products: Vec<ProductRecord>) -> GroupRunRequest {
        GroupRunRequest {
            tag: tag.into(),
            products,
            overrides: None,
        }
    }

    #[tokio::test]
    async fn run_group_stage_sequence() {
        let pipeline = pipeline_with(
            Arc::new(ScriptedModel::replies(vec![TV_MATCH])),
            Arc::new(ScriptedModel::replies(vec![TV_VALUES])),
        );
        let resp = pipeline.run_group(group("tv", tv_products(4)), None).await.unwrap();
        let names: Vec<String> = resp.stages.iter().map(|s| s.name.clone()).collect();
        assert_eq!(
            names,
            vec!["match_category", "resolve_schema", "extract_attributes", "build_payload"]
        );
        assert_eq!(resp.category_match.node.id, "1");
        assert_eq!(resp.run.results.len(), 4);
        assert_eq!(resp.upload.products.len(), 4);
        assert_eq!(
            Value::Object(resp.upload.products["tv-0"].clone()),
            json!({"display-resolution": "4K", "screen-size": "55 in"})
        );
    }

    #[tokio::test]
    async fn match_is_persisted_and_reused() {
        let match_model = Arc::new(ScriptedModel::replies(vec![TV_MATCH]));
        let pipeline = pipeline_with(match_model.clone(), Arc::new(ScriptedModel::replies(vec![TV_VALUES])));

        let first = pipeline
            .match_group(MatchRequest { tag: "tv".into(), products: tv_products(2), refresh: false })
            .await
            .unwrap();
        assert!(!first.cached);
        let second = pipeline
            .match_group(MatchRequest { tag: "tv".into(), products: tv_products(2), refresh: false })
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.category_match.node.id, "1");
        assert_eq!(match_model.calls(), 1);

        let refreshed = pipeline
            .match_group(MatchRequest { tag: "tv".into(), products: tv_products(2), refresh: true })
            .await
            .unwrap();
        assert!(!refreshed.cached);
        assert_eq!(match_model.calls(), 2);
    }

    #[tokio::test]
    async fn override_skips_the_model_and_inherits_schema() {
        let match_model = Arc::new(ScriptedModel::replies(vec![TV_MATCH]));
        let pipeline = pipeline_with(
            match_model.clone(),
            Arc::new(ScriptedModel::replies(vec![r#"{"color": "black"}"#])),
        );
        let mut request = group("projectors", tv_products(1));
        request.overrides = Some(GroupOverrides {
            category_id: Some("el-1-2".into()),
            refresh_match: false,
        });
        let resp = pipeline.run_group(request, None).await.unwrap();
        assert_eq!(match_model.calls(), 0);
        assert!(resp.schema.inherited);
        assert_eq!(resp.run.results[0].values["color"], "Black");
        assert_eq!(resp.stages[0].output["source"], "override");
    }

    #[tokio::test]
    async fn error_kinds_follow_failure_class() {
        let pipeline = pipeline_with(
            Arc::new(ScriptedModel::replies(vec![r#"{"category_id": "zz-1", "confidence": "high"}"#])),
            Arc::new(ScriptedModel::replies(vec![TV_VALUES])),
        );
        let err = pipeline.run_group(group("tv", tv_products(1)), None).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Unprocessable);
        assert_eq!(err.stage(), "match_category");

        let err = pipeline.run_group(group("  ", tv_products(1)), None).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);

        let err = pipeline.schema_for("nope").unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);

        let err = pipeline.schema_for("hg-2").unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Unprocessable);
    }

    #[tokio::test]
    async fn batch_isolates_group_failures() {
        let match_model = Arc::new(ScriptedModel::new(|messages, _| {
            if messages[1].content.contains("TAG: \"tv\"") {
                Scripted::Reply(TV_MATCH.into())
            } else {
                Scripted::Reply(r#"{"category_id": null, "reasoning": "unclear"}"#.into())
            }
        }));
        let pipeline = pipeline_with(match_model, Arc::new(ScriptedModel::replies(vec![TV_VALUES])));
        let resp = pipeline
            .run_batch(BatchRunRequest {
                groups: vec![group("mystery", tv_products(1)), group("tv", tv_products(2))],
            })
            .await;
        assert_eq!(resp.succeeded, 1);
        assert_eq!(resp.failed, 1);
        assert!(resp.groups[0].error.is_some());
        assert_eq!(resp.groups[1].result.as_ref().unwrap().run.results.len(), 2);
    }

    #[tokio::test]
    async fn partial_extraction_failures_still_succeed() {
        let extract_model = Arc::new(ScriptedModel::new(|messages, _| {
            if messages[1].content.contains("\"tv-1\"") {
                Scripted::Fail("gateway reset".into())
            } else {
                Scripted::Reply(TV_VALUES.into())
            }
        }));
        let pipeline = pipeline_with(Arc::new(ScriptedModel::replies(vec![TV_MATCH])), extract_model);
        let resp = pipeline.run_group(group("tv", tv_products(3)), None).await.unwrap();
        assert_eq!(resp.run.failures, 1);
        assert_eq!(resp.run.failed_product_ids, vec!["tv-1"]);
        assert_eq!(resp.upload.products.len(), 2);
        assert_eq!(resp.stages[2].output["failures"], 1);
    }

    #[test]
    fn reconcile_uses_category_schema() {
        let pipeline = pipeline_with(
            Arc::new(ScriptedModel::replies(vec![])),
            Arc::new(ScriptedModel::replies(vec![])),
        );
        let request: ReconcileRequest = serde_json::from_value(json!({
            "rows": [{"Title": "Acme TV", "Display resolution": "UHD", "Screen size": "55\""}],
            "canonical": [{"id": "tv-0", "title": "Acme TV", "attributes": {"display-resolution": "HD", "legacy": "x"}}],
            "category_id": "1",
            "include_display": true
        }))
        .unwrap();
        let resp = pipeline.reconcile(request).unwrap();
        assert_eq!(
            Value::Object(resp.records[0].attributes.clone()),
            json!({"display-resolution": "4K", "screen-size": "55\""})
        );
        assert_eq!(resp.upload.products["tv-0"]["display-resolution"], "4K");
        assert_eq!(resp.display.unwrap()[0]["Display resolution"], "4K");
    }
}
