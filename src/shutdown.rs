use tokio::sync::watch;
use tokio::time::Duration;
use tracing::info;

/// A stop flag shared by the accept loop and all background loops.
/// Loops check [Shutdown::is_stopped] at their head and sleep with [Shutdown::sleep]
/// so that they wake up as soon as the flag is set.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sets the stop flag. Dropping the trigger counts as a stop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (Shutdown, ShutdownTrigger) {
        let (tx, rx) = watch::channel(false);
        (Shutdown { rx }, ShutdownTrigger { tx })
    }

    pub fn is_stopped(&self) -> bool {
        self.rx.has_changed().is_err() || *self.rx.borrow()
    }

    /// Resolves once the stop flag is set.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // the trigger is gone
                return;
            }
        }
    }

    /// Sleeps for `duration` or until the stop flag is set, whichever comes first.
    pub async fn sleep(&mut self, duration: Duration) {
        if self.is_stopped() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wait() => {}
        }
    }
}

impl ShutdownTrigger {
    pub fn stop(&self) {
        info!("Shutting down");
        // there may be no receivers left, which is fine
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_sleep() {
        let (mut shutdown, trigger) = Shutdown::new();
        assert!(!shutdown.is_stopped());

        let sleeper = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            shutdown.sleep(Duration::from_secs(3600)).await;
            started.elapsed()
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.stop();

        let slept = sleeper.await.unwrap();
        assert!(slept < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_stop() {
        let (mut shutdown, trigger) = Shutdown::new();
        drop(trigger);

        assert!(shutdown.is_stopped());
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn clones_see_the_stop() {
        let (shutdown, trigger) = Shutdown::new();
        let other = shutdown.clone();
        trigger.stop();

        assert!(shutdown.is_stopped());
        assert!(other.is_stopped());
    }
}
