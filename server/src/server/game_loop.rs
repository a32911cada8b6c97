// related_world_server/server/src/server/game_loop.rs
use super::instance::RelatedWorldServer;
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

impl RelatedWorldServer {
    /// Fixed-step loop. Returns once `shutdown` flips to true or its sender
    /// is dropped.
    pub async fn run_game_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> u64 {
        let delta_time_fixed = self.config.tick_seconds();
        let tick_duration = Duration::from_secs_f64(delta_time_fixed);
        let mut tick_timer = interval(tick_duration);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_run = 0u64;

        info!("Game loop started. Tick rate: {}ms, Delta time: {}s", tick_duration.as_millis(), delta_time_fixed);

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let frame_start_time = Instant::now();
            let summary = self.process_frame(delta_time_fixed);
            frames_run += 1;
            histogram!("server_frame_time_seconds").record(summary.duration.as_secs_f64());
            counter!("server_frames_total").increment(1);
            gauge!("server_connections").set(summary.replication.per_connection.len() as f64);

            if summary.frame % self.config.tick_rate.max(1) == 0 {
                debug!(
                    frame = summary.frame,
                    worlds = summary.related_worlds_ticked,
                    connections = summary.replication.per_connection.len(),
                    "Game loop running"
                );
            }

            let frame_time = frame_start_time.elapsed();
            if frame_time > tick_duration + Duration::from_millis(5) {
                warn!("Frame {} took too long: {:?}", summary.frame, frame_time);
            }
        }

        info!(frames_run, "Game loop stopped");
        frames_run
    }
}
