use std::collections::VecDeque;

/// Data-modifying statements of the open transaction, in execution order
#[derive(Debug, Default)]
pub struct TxnLog {
    entries: VecDeque<String>,
    limit: usize,
}

impl TxnLog {
    /// Keep at most `limit` statements, dropping the oldest
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, statement: &str) {
        if self.limit > 0 && self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(statement.to_string());
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
