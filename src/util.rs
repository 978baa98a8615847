use std::{fmt::Display, future::Future, io};

use log::error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub trait ResultExt {
    // Log an error if it occurs, prefixed with s, otherwise return nothing.
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}

// It's an ErrGroup like from Go lol.
// https://stackoverflow.com/questions/79172707/concise-tokio-equivalent-of-gos-errgroup
//
// Used to run the driver loop, each hook worker and the HTTP introspection
// server as sibling tasks that all get torn down together as soon as any one
// of them returns an error.
pub struct ErrGroup {
    ct: CancellationToken,
    join_set: JoinSet<anyhow::Result<()>>,
}

impl ErrGroup {
    pub fn new(ct: CancellationToken) -> Self {
        Self {
            ct,
            join_set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // Drop the returned AbortHandle so we can unwrap the result of the join in wait.
        self.join_set.spawn(task);
    }

    // Block until all tasks are complete, return the first error. As soon as
    // any returns an error, cancel the token passed to new. Panics if any of
    // the tasks panic.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut final_result: anyhow::Result<()> = Ok(());

        while let Some(result) = self.join_set.join_next().await {
            if let Err(err) = result.expect("joining ErrGroup tasks") {
                if final_result.is_ok() {
                    final_result = Err(err)
                }
                self.ct.cancel();
                break;
            }
        }

        // Wait for remaining tasks to exit due to cancellation
        let _ = self.join_set.join_all().await;

        final_result
    }
}

pub trait IoResultExt {
    fn ignore(self, kind: io::ErrorKind) -> Self;
}

impl IoResultExt for io::Result<()> {
    fn ignore(self, kind: io::ErrorKind) -> io::Result<()> {
        match self {
            Err(e) => {
                if e.kind() == kind {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Ok(()) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn errgroup_propagates_first_error() {
        let ct = CancellationToken::new();
        let mut group = ErrGroup::new(ct.clone());
        group.spawn(async { anyhow::bail!("boom") });
        group.spawn(async move {
            ct.cancelled().await;
            Ok(())
        });
        let result = group.wait().await;
        assert!(result.is_err());
    }

    #[test]
    fn ignore_matches_only_requested_kind() {
        let not_found: io::Result<()> = Err(io::Error::from(io::ErrorKind::NotFound));
        assert!(not_found.ignore(io::ErrorKind::NotFound).is_ok());

        let other: io::Result<()> = Err(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(other.ignore(io::ErrorKind::NotFound).is_err());
    }
}
