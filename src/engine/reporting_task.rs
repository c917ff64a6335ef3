use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::stats::Stats;

pub(super) fn start_reporting_task(
    stats: Arc<Stats>,
    interval: Duration,
    stop_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut stop_rx = stop_tx.subscribe();
    tokio::spawn(async move {
        'run: loop {
            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);

            tokio::select! {
                _ = stop_rx.recv() => {
                    break 'run;
                }
                _ = &mut sleep => {
                    let snap = stats.snapshot();
                    log::info!(
                        "{} crawled at {} pages/minute, {} processed at {} items/minute \
                         ({} enqueued, {} dequeued, {} filtered)",
                        snap.crawled,
                        stats.crawled_per_minute(),
                        snap.processed,
                        stats.processed_per_minute(),
                        snap.enqueued,
                        snap.dequeued,
                        snap.filtered,
                    );
                }
            }
        }
    })
}
