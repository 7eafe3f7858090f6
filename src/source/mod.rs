use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::record::RawRecord;

pub mod local;
pub mod remote;

/// One page of candidate records pulled from a source, plus a count of
/// entries that were present but undecodable (unusable key or payload).
#[derive(Debug, Default)]
pub struct SourcePage {
    pub records: Vec<RawRecord>,
    pub malformed: usize,
}

/// Paginated reader over raw game records. Implementations advance an
/// internal continuation cursor per call and signal exhaustion with `None`.
#[async_trait]
pub trait RecordSource {
    /// Human label for logs.
    fn label(&self) -> &str;

    async fn next_page(&mut self) -> Result<Option<SourcePage>, IngestError>;
}

/// In-memory source backing `seed` and tests.
#[derive(Debug)]
pub struct StaticSource {
    pages: VecDeque<Vec<RawRecord>>,
    label: String,
}

impl StaticSource {
    pub fn new(records: Vec<RawRecord>, page_size: usize, label: &str) -> Self {
        let size = page_size.max(1);
        let mut pages = VecDeque::new();
        let mut current = Vec::with_capacity(size);
        for rec in records {
            current.push(rec);
            if current.len() == size {
                pages.push_back(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            pages.push_back(current);
        }
        Self {
            pages,
            label: label.to_string(),
        }
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn next_page(&mut self) -> Result<Option<SourcePage>, IngestError> {
        Ok(self.pages.pop_front().map(|records| SourcePage {
            records,
            malformed: 0,
        }))
    }
}
