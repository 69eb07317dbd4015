//! End-to-end pipelines: chunk, embed, batch.

use async_trait::async_trait;
use flowlite::pipeline::{Envelope, ExecutionMode, StageError, StageHandler};
use flowlite::{
    FlowliteError, PipelineBuilder, PipelineOptions, RetryPolicy, Sequence, Stage, StepContext,
    StepOptions,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Document {
    id: u32,
    body: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Embedded {
    text: String,
    vector: Vec<f32>,
}

/// Fake embedding service that fails the first call for selected inputs.
#[derive(Default)]
struct EmbedClient {
    flaky: Vec<String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl EmbedClient {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut calls = self.calls.lock();
        let seen = calls.entry(text.to_string()).or_default();
        *seen += 1;
        if *seen == 1 && self.flaky.iter().any(|f| f == text) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "embedding service reset the connection",
            )
            .into());
        }
        Ok(vec![text.len() as f32, 1.0])
    }

    fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().get(text).copied().unwrap_or(0)
    }
}

struct Embed;

#[async_trait]
impl StageHandler<String, Embedded> for Embed {
    async fn execute(&self, input: String, ctx: &StepContext) -> anyhow::Result<Embedded> {
        let client = ctx
            .resource::<Arc<EmbedClient>>()
            .ok_or_else(|| StageError::tagged("missing-client", "no embed client"))?;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let vector = client.embed(&input)?;
        Ok(Embedded {
            text: input,
            vector,
        })
    }
}

fn documents() -> Vec<Document> {
    vec![
        Document {
            id: 1,
            body: "alpha beta. gamma".into(),
        },
        Document {
            id: 2,
            body: String::new(),
        },
        Document {
            id: 3,
            body: "delta. epsilon zeta. eta".into(),
        },
    ]
}

fn chunk(doc: Document) -> Vec<String> {
    doc.body
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_chunk_embed_batch_with_retry() {
    let client = Arc::new(EmbedClient {
        flaky: vec!["gamma".into(), "eta".into()],
        ..Default::default()
    });

    let pipeline = PipelineBuilder::<Document, Document>::new()
        .with_resource(Arc::clone(&client))
        .flat_map_step(
            "chunks",
            |doc: Document, _ctx| async move { anyhow::Ok(chunk(doc)) },
            StepOptions::default(),
        )
        .add_step(
            Stage::new("embed", Embed).with_retry(RetryPolicy::new(3, 1)),
            StepOptions::parallel(4),
        )
        .batch_step("upsert_batch", 2)
        .build()
        .unwrap();

    let (batches, metrics) = pipeline
        .execute_with_metrics(Sequence::from_items(documents()))
        .await
        .unwrap();

    let texts: Vec<Vec<&str>> = batches
        .iter()
        .map(|batch| batch.iter().map(|e| e.text.as_str()).collect())
        .collect();
    assert_eq!(
        texts,
        vec![
            vec!["alpha beta", "gamma"],
            vec!["delta", "epsilon zeta"],
            vec!["eta"],
        ]
    );
    assert_eq!(batches[0][0].vector, vec![10.0, 1.0]);

    assert_eq!(client.calls_for("gamma"), 2);
    assert_eq!(client.calls_for("eta"), 2);
    assert_eq!(client.calls_for("delta"), 1);

    let embed = metrics.operation("embed").unwrap();
    assert_eq!(
        embed.execution,
        ExecutionMode::Parallel {
            concurrency: 4,
            ordered: true
        }
    );
    assert_eq!(embed.stream.successful_items, 5);
    assert_eq!(metrics.operation("upsert_batch").unwrap().stream.successful_items, 3);
}

#[tokio::test]
async fn test_later_steps_read_earlier_outputs() {
    let pipeline = PipelineBuilder::<Document, Document>::new()
        .map_step(
            "word_count",
            |doc: Document, _ctx| async move { anyhow::Ok(doc.body.split_whitespace().count()) },
            StepOptions::default(),
        )
        .map_step(
            "summary",
            |words: usize, ctx: StepContext| async move {
                let prior = ctx
                    .get::<usize>("word_count")
                    .ok_or_else(|| anyhow::anyhow!("word_count missing"))?;
                anyhow::Ok(format!("{words} words (recorded {prior})"))
            },
            StepOptions::default(),
        )
        .build()
        .unwrap();

    let envelopes: Vec<Envelope<String>> = pipeline
        .run(Sequence::from_items(documents()))
        .into_envelopes()
        .to_vec()
        .await
        .unwrap();

    let summaries: Vec<&str> = envelopes.iter().map(|e| e.value.as_str()).collect();
    assert_eq!(
        summaries,
        vec![
            "3 words (recorded 3)",
            "0 words (recorded 0)",
            "4 words (recorded 4)"
        ]
    );
    assert!(envelopes.iter().all(|e| e.state.len() == 2));
}

#[tokio::test]
async fn test_permanent_failure_is_single_structured_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let pipeline = PipelineBuilder::<Document, Document>::new()
        .map_step(
            "validate",
            move |doc: Document, _ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if doc.body.is_empty() {
                        return Err(anyhow::Error::from(StageError::tagged(
                            "empty-document",
                            format!("document {} has no body", doc.id),
                        )));
                    }
                    anyhow::Ok(doc)
                }
            },
            StepOptions::default(),
        )
        .build()
        .unwrap();

    let err = pipeline
        .execute_to_array(Sequence::from_items(documents()))
        .await
        .unwrap_err();

    let FlowliteError::Step { failure, cause } = &err else {
        panic!("expected step failure, got {err:?}");
    };
    let original = cause.downcast_ref::<StageError>().unwrap();
    assert_eq!(original.tag, "empty-document");
    assert_eq!(failure.step, "validate");
    assert_eq!(failure.code, "empty-document");
    assert_eq!(failure.message, "document 2 has no body");
    assert!(!failure.retryable);
    assert_eq!(failure.attempts, 1);
    // Document 3 is never processed.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_options_from_json_drive_parallel_defaults() {
    let options = PipelineOptions::from_json(
        r#"{"default_concurrency": 3, "collect_metrics": false}"#,
    )
    .unwrap();

    let pipeline = PipelineBuilder::<u32, u32>::new()
        .with_options(options)
        .map_step(
            "square",
            |x: u32, _ctx| async move { anyhow::Ok(x * x) },
            StepOptions {
                parallel: true,
                concurrency: None,
                ordered: false,
            },
        )
        .build()
        .unwrap();

    assert_eq!(
        pipeline.execution_mode("square"),
        Some(ExecutionMode::Parallel {
            concurrency: 3,
            ordered: false
        })
    );

    let mut out = pipeline
        .execute_to_array(Sequence::from_items(1..=6u32))
        .await
        .unwrap();
    out.sort_unstable();
    assert_eq!(out, vec![1, 4, 9, 16, 25, 36]);
}
