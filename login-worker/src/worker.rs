use std::time::Instant;

use login_common::{
    queue::{Delivery, QueueConsumer},
    record::{RecordError, RecordTransformer, RunBatch},
    sink::BatchSink,
};
use tracing::{error, info, warn};

use crate::config::{AcknowledgeMode, MalformedRecordPolicy};
use crate::error::WorkerError;

/// What a completed run did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Messages handed out by the queue.
    pub received: usize,
    /// Records written to the store.
    pub written: usize,
    /// Messages dropped under `MalformedRecordPolicy::Skip`.
    pub skipped: usize,
    /// Messages removed from the queue after the write.
    pub acknowledged: usize,
    /// Why polling stopped early, if it did. The run still wrote whatever came before.
    pub poll_error: Option<WorkerError>,
}

impl RunReport {
    pub fn poll_failed(&self) -> bool {
        self.poll_error.is_some()
    }
}

/// Runs the pipeline once: poll the queue, sanitize every message, replace the table.
pub struct RunOrchestrator<'a> {
    consumer: QueueConsumer<'a>,
    transformer: RecordTransformer,
    sink: &'a dyn BatchSink,
    policy: MalformedRecordPolicy,
    acknowledge: AcknowledgeMode,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(
        consumer: QueueConsumer<'a>,
        transformer: RecordTransformer,
        sink: &'a dyn BatchSink,
    ) -> Self {
        Self {
            consumer,
            transformer,
            sink,
            policy: MalformedRecordPolicy::default(),
            acknowledge: AcknowledgeMode::default(),
        }
    }

    pub fn malformed_record_policy(mut self, policy: MalformedRecordPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn acknowledge(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge = mode;
        self
    }

    /// Execute one run.
    ///
    /// Source failures never stop the write: a failed receive leaves the batch empty, and a body
    /// that cannot be decoded ends polling with the records sanitized before it. Either way the
    /// error is kept in `RunReport::poll_error`. Records that decode but cannot be transformed
    /// follow the `MalformedRecordPolicy`, and store failures end the run.
    pub async fn run(&self) -> Result<RunReport, WorkerError> {
        let started = Instant::now();
        let mut report = RunReport::default();

        let deliveries = match self.consumer.poll().await {
            Ok(deliveries) => deliveries,
            Err(error) => {
                error!(?error, "failed to poll the queue, continuing with an empty batch");
                metrics::counter!("login_pipeline_poll_failures_total").increment(1);
                report.poll_error = Some(WorkerError::Queue(error));
                Vec::new()
            }
        };
        report.received = deliveries.len();

        let (batch, processed) = self.sanitize(deliveries, &mut report)?;

        self.sink.write(&batch).await?;
        report.written = batch.len();
        metrics::counter!("login_pipeline_records_written_total").increment(batch.len() as u64);

        if self.acknowledge == AcknowledgeMode::AfterWrite {
            match self.consumer.acknowledge(&processed).await {
                Ok(()) => report.acknowledged = processed.len(),
                Err(error) => {
                    // Not fatal: the messages come back on a later run.
                    warn!(?error, "failed to acknowledge processed messages");
                    metrics::counter!("login_pipeline_acknowledge_failures_total").increment(1);
                }
            }
        }

        metrics::counter!("login_pipeline_runs_total").increment(1);
        metrics::histogram!("login_pipeline_run_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            received = report.received,
            written = report.written,
            skipped = report.skipped,
            acknowledged = report.acknowledged,
            poll_failed = report.poll_failed(),
            "run complete"
        );

        Ok(report)
    }

    /// Transform every delivery in arrival order, returning the batch and the receipt handles of
    /// the messages it accounts for.
    fn sanitize(
        &self,
        deliveries: Vec<Delivery>,
        report: &mut RunReport,
    ) -> Result<(RunBatch, Vec<String>), WorkerError> {
        let mut batch = RunBatch::new();
        let mut processed = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            let message_id = delivery
                .message_id
                .unwrap_or_else(|| "<unknown>".to_owned());

            let raw = match delivery.event {
                Ok(raw) => raw,
                Err(error) if self.policy == MalformedRecordPolicy::Skip => {
                    skip(&message_id, &error, report);
                    processed.extend(delivery.receipt_handle);
                    continue;
                }
                Err(error) => {
                    error!(
                        %message_id,
                        ?error,
                        "failed to decode message, continuing with the records before it"
                    );
                    metrics::counter!("login_pipeline_poll_failures_total").increment(1);
                    report.poll_error =
                        Some(WorkerError::UndecodableMessage { message_id, error });
                    break;
                }
            };

            match self.transformer.transform(raw) {
                Ok(record) => batch.push(record),
                Err(error) => match self.policy {
                    MalformedRecordPolicy::Abort => {
                        return Err(WorkerError::MalformedRecord { message_id, error });
                    }
                    MalformedRecordPolicy::Skip => skip(&message_id, &error, report),
                },
            }

            processed.extend(delivery.receipt_handle);
        }

        Ok((batch, processed))
    }
}

fn skip(message_id: &str, error: &RecordError, report: &mut RunReport) {
    warn!(message_id, %error, "skipping malformed login record");
    metrics::counter!("login_pipeline_records_skipped_total").increment(1);
    report.skipped += 1;
}
