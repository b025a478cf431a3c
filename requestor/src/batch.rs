use crate::lifecycle::{HandleError, HandleSource, RequestLifecycle};
use crate::types::{CreateParams, HandleKind, RequestHandle};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of one pipeline run over a set of entities.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub resolved: Vec<(RequestHandle, HandleSource)>,
    pub failed: Vec<HandleError>,
}

impl BatchReport {
    pub fn by_source(&self) -> BTreeMap<HandleSource, usize> {
        let mut counts = BTreeMap::new();
        for (_, source) in &self.resolved {
            *counts.entry(*source).or_default() += 1;
        }
        counts
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "resolved {} of {} entities",
            self.resolved.len(),
            self.resolved.len() + self.failed.len()
        )?;
        for (source, count) in self.by_source() {
            writeln!(f, "  {source}: {count}")?;
        }
        if !self.failed.is_empty() {
            writeln!(f, "failed {}:", self.failed.len())?;
            for err in &self.failed {
                let status = err
                    .last_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                writeln!(f, "  {} [{}] {}", err.entity_id, status, err.reason)?;
            }
        }
        Ok(())
    }
}

/// Resolves a handle for every entity in order. A failure is recorded and the
/// run moves on to the next entity.
pub async fn run_batch<S: AsRef<str>>(
    lifecycle: &RequestLifecycle,
    entities: &[S],
    kind: HandleKind,
    params: &CreateParams,
) -> BatchReport {
    let mut report = BatchReport::default();

    for entity_id in entities {
        match lifecycle.resolve(entity_id.as_ref(), kind, params).await {
            Ok(resolution) => report.resolved.push((resolution.handle, resolution.source)),
            Err(err) => report.failed.push(err),
        }
    }

    tracing::info!(
        %kind,
        resolved = report.resolved.len(),
        failed = report.failed.len(),
        "Batch finished"
    );
    report
}
