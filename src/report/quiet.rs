use crate::report::{Reporter, Summary};

/// A filter in front of another reporter that lets only errors and the final
///  summary through.
pub struct Quiet<R: Reporter> {
    inner: R,
}

impl<R: Reporter> Quiet<R> {
    pub fn new(inner: R) -> Quiet<R> {
        Quiet { inner }
    }
}

impl<R: Reporter> Reporter for Quiet<R> {
    fn on_debug(&mut self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_info(&mut self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_warning(&mut self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&mut self, message: &str) -> anyhow::Result<()> {
        self.inner.on_error(message)
    }

    fn on_speed(&mut self, _test: &str, _speed: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_summary(&mut self, summary: &Summary) -> anyhow::Result<()> {
        self.inner.on_summary(summary)
    }
}
