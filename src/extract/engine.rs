use crate::catalog::ProductRecord;
use crate::extract::{ExtractError, ExtractionResult, request, values};
use crate::llm::{ChatModel, LlmMessage};
use crate::reconcile::KeyMap;
use crate::taxonomy::AttributeDef;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Completion intervals kept for the rolling ETA.
const ETA_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub concurrency: usize,
    pub request_timeout: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub completed: usize,
    pub total: usize,
    pub failures: usize,
    pub elapsed_ms: u64,
    pub eta_ms: Option<u64>,
}

pub type ProgressSink = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRun {
    pub results: Vec<ExtractionResult>,
    pub failures: usize,
    pub failed_product_ids: Vec<String>,
    pub filled_fields: usize,
    pub products_with_values: usize,
    pub elapsed_ms: u64,
}

struct Progress {
    total: usize,
    completed: usize,
    failures: usize,
    started: Instant,
    last: Instant,
    intervals: VecDeque<Duration>,
    log_every: usize,
    sink: Option<ProgressSink>,
}

impl Progress {
    fn new(total: usize, sink: Option<ProgressSink>) -> Self {
        let now = Instant::now();
        Self {
            total,
            completed: 0,
            failures: 0,
            started: now,
            last: now,
            intervals: VecDeque::with_capacity(ETA_WINDOW),
            log_every: (total / 10).max(1),
            sink,
        }
    }

    fn record(&mut self, failed: bool) {
        let now = Instant::now();
        if self.intervals.len() == ETA_WINDOW {
            self.intervals.pop_front();
        }
        self.intervals.push_back(now.duration_since(self.last));
        self.last = now;
        self.completed += 1;
        if failed {
            self.failures += 1;
        }

        let update = ProgressUpdate {
            completed: self.completed,
            total: self.total,
            failures: self.failures,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            eta_ms: self.eta().map(|eta| eta.as_millis() as u64),
        };
        if self.completed % self.log_every == 0 || self.completed == self.total {
            info!(
                target = "metafield.extract",
                completed = update.completed,
                total = update.total,
                failures = update.failures,
                eta_ms = update.eta_ms,
                "extraction progress {}/{}",
                update.completed,
                update.total
            );
        }
        if let Some(sink) = &self.sink {
            sink(&update);
        }
    }

    /// Mean of recent completion intervals times the remaining count.
    fn eta(&self) -> Option<Duration> {
        if self.intervals.is_empty() {
            return None;
        }
        let remaining = self.total.saturating_sub(self.completed) as u32;
        let sum: Duration = self.intervals.iter().sum();
        let mean = sum / self.intervals.len() as u32;
        Some(mean * remaining)
    }
}

#[derive(Clone)]
pub struct ExtractionEngine {
    llm: Arc<dyn ChatModel>,
    config: ExtractionConfig,
}

impl ExtractionEngine {
    pub fn new(llm: Arc<dyn ChatModel>, config: ExtractionConfig) -> Self {
        Self { llm, config }
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Extracts values for every product with at most `concurrency` model
    /// calls in flight. Output order matches input order. A product that
    /// fails or times out gets an empty value map and never affects its
    /// siblings.
    pub async fn run(
        &self,
        products: &[ProductRecord],
        category_path: &str,
        defs: &[AttributeDef],
        progress: Option<ProgressSink>,
    ) -> ExtractionRun {
        let started = Instant::now();
        let total = products.len();
        let defs: Arc<[AttributeDef]> = Arc::from(defs);
        let keys = Arc::new(KeyMap::build(&defs));
        let semaphore = Arc::new(Semaphore::new(self.concurrency()));

        let mut tasks = JoinSet::new();
        let mut positions = HashMap::with_capacity(total);
        for (idx, product) in products.iter().enumerate() {
            let messages = request::build_messages(product, category_path, &defs);
            let llm = self.llm.clone();
            let defs = defs.clone();
            let keys = keys.clone();
            let semaphore = semaphore.clone();
            let timeout = self.config.request_timeout;
            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                extract_one(llm.as_ref(), &messages, &defs, &keys, timeout).await
            });
            positions.insert(handle.id(), idx);
        }

        let mut slots: Vec<Option<Result<Map<String, Value>, String>>> = vec![None; total];
        let mut tracker = Progress::new(total, progress);
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, result)) => (id, result.map_err(|err| err.to_string())),
                Err(err) => (err.id(), Err(format!("extraction task failed: {err}"))),
            };
            let Some(idx) = positions.get(&id).copied() else {
                continue;
            };
            if let Err(reason) = &outcome {
                warn!(
                    target = "metafield.extract",
                    product_id = %products[idx].id,
                    error = %reason,
                    "product extraction failed"
                );
            }
            tracker.record(outcome.is_err());
            slots[idx] = Some(outcome);
        }

        let mut run = ExtractionRun {
            results: Vec::with_capacity(total),
            failures: 0,
            failed_product_ids: Vec::new(),
            filled_fields: 0,
            products_with_values: 0,
            elapsed_ms: 0,
        };
        for (product, slot) in products.iter().zip(slots) {
            let result = match slot.unwrap_or_else(|| Err("extraction did not complete".into())) {
                Ok(values) => ExtractionResult {
                    product_id: product.id.clone(),
                    values,
                    error: None,
                },
                Err(reason) => {
                    run.failures += 1;
                    run.failed_product_ids.push(product.id.clone());
                    ExtractionResult {
                        product_id: product.id.clone(),
                        values: Map::new(),
                        error: Some(reason),
                    }
                }
            };
            let filled = result.filled();
            run.filled_fields += filled;
            if filled > 0 {
                run.products_with_values += 1;
            }
            run.results.push(result);
        }
        run.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            target = "metafield.extract",
            products = total,
            failures = run.failures,
            filled_fields = run.filled_fields,
            products_with_values = run.products_with_values,
            elapsed_ms = run.elapsed_ms,
            "extraction finished"
        );
        crate::metrics::extraction_finished(total, run.failures, run.elapsed_ms);
        run
    }
}

async fn extract_one(
    llm: &dyn ChatModel,
    messages: &[LlmMessage],
    defs: &[AttributeDef],
    keys: &KeyMap,
    timeout: Duration,
) -> Result<Map<String, Value>, ExtractError> {
    let response = tokio::time::timeout(timeout, llm.chat(messages))
        .await
        .map_err(|_| ExtractError::Timeout(timeout))??;
    values::parse_response(&response.text, defs, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedModel};
    use crate::taxonomy::index::tests::tv_index;
    use crate::taxonomy::schema;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn products(n: usize) -> Vec<ProductRecord> {
        (0..n)
            .map(|i| ProductRecord {
                id: format!("p{i}"),
                title: format!("Product {i}"),
                ..Default::default()
            })
            .collect()
    }

    fn product_index(messages: &[LlmMessage]) -> usize {
        let body: Value = serde_json::from_str(&messages[1].content).unwrap();
        body["product"]["id"].as_str().unwrap()[1..].parse().unwrap()
    }

    fn tv_defs() -> Vec<AttributeDef> {
        let index = tv_index();
        schema::resolve(index.lookup_by_id("1").unwrap()).unwrap()
    }

    fn engine(model: Arc<ScriptedModel>, concurrency: usize, timeout: Duration) -> ExtractionEngine {
        ExtractionEngine::new(
            model,
            ExtractionConfig {
                concurrency,
                request_timeout: timeout,
            },
        )
    }

    #[tokio::test]
    async fn resolution_in_pixels_becomes_allowed_value() {
        let model = Arc::new(ScriptedModel::replies(vec![
            r#"{"metafields": {"display-resolution": "3840x2160", "screen-size": null}}"#,
        ]));
        let product = ProductRecord {
            id: "tv-1".into(),
            title: "Acme Smart TV".into(),
            description_html: Some("<p>Stunning 3840x2160 resolution panel.</p>".into()),
            ..Default::default()
        };
        let run = engine(model.clone(), 5, Duration::from_secs(5))
            .run(&[product], "Electronics > TV", &tv_defs(), None)
            .await;

        assert_eq!(run.results[0].values["display-resolution"], "4K");
        assert_eq!(run.results[0].values["screen-size"], Value::Null);
        assert_eq!(run.failures, 0);
        assert_eq!(run.filled_fields, 1);

        let sent = &model.prompts()[0][1].content;
        assert!(sent.contains("3840x2160 resolution"));
        assert!(sent.contains("\"allowedValues\":[\"4K\",\"8K\",\"HD\"]"));
    }

    #[tokio::test]
    async fn missing_size_stays_null() {
        let model = Arc::new(ScriptedModel::replies(vec![
            r#"{"metafields": {"display-resolution": null, "screen-size": null}}"#,
        ]));
        let product = ProductRecord {
            id: "tv-2".into(),
            title: "Acme TV".into(),
            description_html: Some("A great television for any room.".into()),
            ..Default::default()
        };
        let run = engine(model, 2, Duration::from_secs(5))
            .run(&[product], "Electronics > TV", &tv_defs(), None)
            .await;
        assert_eq!(
            Value::Object(run.results[0].values.clone()),
            json!({"display-resolution": null, "screen-size": null})
        );
        assert_eq!(run.products_with_values, 0);
        assert_eq!(run.failures, 0);
    }

    #[tokio::test]
    async fn timeouts_are_isolated_failures() {
        let model = Arc::new(ScriptedModel::new(|messages, _| {
            let idx = product_index(messages);
            let reply = r#"{"display-resolution": "4K"}"#.to_string();
            if idx == 3 || idx == 7 {
                Scripted::Delay(Duration::from_secs(30), reply)
            } else {
                Scripted::Reply(reply)
            }
        }));
        let input = products(10);
        let run = engine(model, 4, Duration::from_millis(200))
            .run(&input, "Electronics > TV", &tv_defs(), None)
            .await;

        assert_eq!(run.results.len(), 10);
        assert_eq!(run.failures, 2);
        assert_eq!(run.failed_product_ids, vec!["p3", "p7"]);
        assert_eq!(run.products_with_values, 8);
        for (idx, result) in run.results.iter().enumerate() {
            assert_eq!(result.product_id, input[idx].id);
            if idx == 3 || idx == 7 {
                assert!(result.values.is_empty());
                assert!(result.error.as_deref().unwrap().contains("timed out"));
            } else {
                assert_eq!(result.values["display-resolution"], "4K");
            }
        }
    }

    #[tokio::test]
    async fn output_order_matches_input_despite_completion_order() {
        for concurrency in [1, 3, 16] {
            let model = Arc::new(ScriptedModel::new(|messages, _| {
                let idx = product_index(messages);
                // later products finish first
                Scripted::Delay(
                    Duration::from_millis((12 - idx as u64) * 5),
                    format!(r#"{{"screen-size": "{idx} in"}}"#),
                )
            }));
            let input = products(12);
            let run = engine(model, concurrency, Duration::from_secs(5))
                .run(&input, "Electronics > TV", &tv_defs(), None)
                .await;
            let ids: Vec<&str> = run.results.iter().map(|r| r.product_id.as_str()).collect();
            let expected: Vec<&str> = input.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, expected);
            for (idx, result) in run.results.iter().enumerate() {
                assert_eq!(result.values["screen-size"], format!("{idx} in"));
            }
        }
    }

    #[tokio::test]
    async fn malformed_and_failed_calls_yield_empty_maps() {
        let model = Arc::new(ScriptedModel::new(|messages, _| match product_index(messages) {
            0 => Scripted::Reply("not json".into()),
            1 => Scripted::Fail("connection reset".into()),
            _ => Scripted::Reply(r#"{"display-resolution": "Retina", "screen-size": "55\""}"#.into()),
        }));
        let run = engine(model, 2, Duration::from_secs(5))
            .run(&products(3), "Electronics > TV", &tv_defs(), None)
            .await;
        assert_eq!(run.failures, 2);
        assert!(run.results[0].values.is_empty());
        assert!(run.results[1].values.is_empty());
        // one bad field does not discard the other
        assert_eq!(
            Value::Object(run.results[2].values.clone()),
            json!({"display-resolution": null, "screen-size": "55\""})
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        struct Counting {
            in_flight: Arc<std::sync::atomic::AtomicUsize>,
            peak: Arc<std::sync::atomic::AtomicUsize>,
        }
        #[async_trait::async_trait]
        impl ChatModel for Counting {
            async fn chat(
                &self,
                _messages: &[LlmMessage],
            ) -> Result<crate::llm::LlmResponse, crate::llm::LlmError> {
                use std::sync::atomic::Ordering;
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(crate::llm::LlmResponse {
                    text: "{}".into(),
                    usage: None,
                })
            }
        }
        let engine = ExtractionEngine::new(
            Arc::new(Counting {
                in_flight: in_flight.clone(),
                peak: peak.clone(),
            }),
            ExtractionConfig {
                concurrency: 3,
                request_timeout: Duration::from_secs(5),
            },
        );
        let run = engine.run(&products(20), "X", &tv_defs(), None).await;
        assert_eq!(run.results.len(), 20);
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn progress_reports_every_completion() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink_updates = updates.clone();
        let sink: ProgressSink = Arc::new(move |update: &ProgressUpdate| {
            sink_updates.lock().unwrap().push(update.clone());
        });
        let model = Arc::new(ScriptedModel::replies(vec!["{}"]));
        engine(model, 2, Duration::from_secs(5))
            .run(&products(5), "X", &tv_defs(), Some(sink))
            .await;
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 5);
        assert_eq!(updates.last().unwrap().completed, 5);
        assert_eq!(updates.last().unwrap().eta_ms, Some(0));
        assert!(updates.iter().all(|u| u.total == 5));
    }

    #[tokio::test]
    async fn empty_input_is_an_empty_run() {
        let model = Arc::new(ScriptedModel::replies(vec!["{}"]));
        let run = engine(model.clone(), 2, Duration::from_secs(5))
            .run(&[], "X", &tv_defs(), None)
            .await;
        assert!(run.results.is_empty());
        assert_eq!(model.calls(), 0);
    }
}
