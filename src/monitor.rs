//! Fire-and-forget monitoring-info submission.
//!
//! After a successful open the job id is reported to the data server that
//! satisfied it, so server-side monitoring can correlate transfers. The
//! submission is best-effort: it runs on its own task, its response is
//! ignored, and nothing in the read path waits on it.

use crate::client::{url, FileClient, RemoteFile};
use crate::config::MONITOR_ID_ENV;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Submission timeout for the info request.
const SEND_INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// The job id to report, when one is configured.
pub(crate) fn job_id() -> Option<String> {
    std::env::var(MONITOR_ID_ENV)
        .ok()
        .filter(|id| !id.is_empty())
}

/// Reports the job id to the server behind a freshly opened handle.
///
/// Skipped when no job id is configured or the handle has no `LastURL`.
/// Some dCache versions close the connection when sent monitoring info, so
/// servers advertising `org.dcache.uuid` are skipped as well.
pub(crate) fn send_monitoring_info(client: &Arc<dyn FileClient>, file: &dyn RemoteFile) {
    let Some(job_id) = job_id() else { return };
    let Some(last_url) = file.property("LastURL").filter(|u| !u.is_empty()) else {
        return;
    };
    if url::has_param(&last_url, "org.dcache.uuid") {
        return;
    }
    info!(job_id = %job_id, url = %last_url, "Set monitoring id");
    let filesystem = client.filesystem(&last_url);
    tokio::spawn(async move {
        let _ = tokio::time::timeout(SEND_INFO_TIMEOUT, filesystem.send_info(&job_id)).await;
    });
}
