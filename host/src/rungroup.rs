//! Supervision of the session's long-lived actors.
//!
//! Every actor is registered as a named `(run, cancel)` pair.  The
//! group runs them concurrently; as soon as any one of them returns —
//! error or clean — every cancel function is invoked exactly once and
//! the remaining actors are drained.  The first actor's result is the
//! group's result.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinSet;

type ActorFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type CancelFn = Box<dyn FnOnce() + Send>;

struct Actor {
    name: &'static str,
    run: ActorFuture,
    cancel: CancelFn,
}

#[derive(Default)]
pub struct RunGroup {
    actors: Vec<Actor>,
    /// How long to wait for the rest of the group after cancelling.
    drain_timeout: Duration,
}

impl RunGroup {
    pub fn new() -> Self {
        Self {
            actors: Vec::new(),
            drain_timeout: Duration::from_secs(10),
        }
    }

    pub fn add<F, C>(&mut self, name: &'static str, run: F, cancel: C)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.actors.push(Actor {
            name,
            run: Box::pin(run),
            cancel: Box::new(cancel),
        });
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut set = JoinSet::new();
        let mut cancels = Vec::new();
        for actor in self.actors {
            let name = actor.name;
            let run = actor.run;
            cancels.push((actor.name, actor.cancel));
            set.spawn(async move { (name, run.await) });
        }

        let first = match set.join_next().await {
            Some(Ok((name, result))) => {
                match &result {
                    Ok(()) => log::debug!("actor {name} finished, unwinding the group"),
                    Err(err) => log::debug!("actor {name} failed, unwinding the group: {err:#}"),
                }
                result
            }
            Some(Err(join_err)) => Err(anyhow::anyhow!("actor panicked: {join_err}")),
            None => Ok(()),
        };

        for (name, cancel) in cancels {
            log::trace!("cancelling actor {name}");
            cancel();
        }

        let drain = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => log::trace!("actor {name} unwound"),
                    Ok((name, Err(err))) => log::debug!("actor {name} unwound with: {err:#}"),
                    Err(join_err) => log::debug!("actor panicked during unwind: {join_err}"),
                }
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            log::warn!("actors did not unwind within {:?}; abandoning them", self.drain_timeout);
        }

        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn first_exit_cancels_every_actor_exactly_once() {
        let mut group = RunGroup::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let token = CancellationToken::new();
            let counter = cancelled.clone();
            let run_token = token.clone();
            group.add(
                "waiter",
                async move {
                    run_token.cancelled().await;
                    Ok(())
                },
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                },
            );
        }

        group.add("trigger", async { Ok(()) }, || {});

        tokio::time::timeout(Duration::from_secs(5), group.run())
            .await
            .expect("group unwinds promptly")
            .unwrap();
        k9::assert_equal!(cancelled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn first_error_is_the_group_result() {
        let mut group = RunGroup::new();
        let token = CancellationToken::new();
        let run_token = token.clone();
        group.add(
            "waiter",
            async move {
                run_token.cancelled().await;
                Ok(())
            },
            move || token.cancel(),
        );
        group.add("boom", async { anyhow::bail!("exploded") }, || {});

        let err = group.run().await.unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }
}
