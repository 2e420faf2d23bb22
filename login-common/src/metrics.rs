//! A run exits as soon as it is done, so there is nothing for Prometheus to scrape.
//! Instead the recorder is rendered once at exit into a textfile for node_exporter to pick up.
use std::path::Path;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Write the current metrics to `path`, replacing it atomically so a collector never sees a
/// half-written file.
pub async fn write_textfile(handle: &PrometheusHandle, path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, handle.render()).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_textfile_renders_recorded_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("login_pipeline_runs_total").increment(3);
        });

        let path = std::env::temp_dir().join(format!("login-pipeline-{}.prom", std::process::id()));
        write_textfile(&handle, &path)
            .await
            .expect("failed to write textfile");

        let contents = tokio::fs::read_to_string(&path)
            .await
            .expect("failed to read textfile");
        tokio::fs::remove_file(&path).await.ok();

        assert!(contents.contains("login_pipeline_runs_total 3"));
    }
}
