use serde::{Deserialize, Serialize};
use crate::errors::{AppError, Result};
use super::PlaylistEntry;

/// Which playlist entries become work units.
///
/// Applied in a fixed order: explicit id / position filter, then the
/// inclusive `start..=end` range (0-based, over what the filter kept), then
/// `max_items`, and finally `reverse`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaylistSelection {
    #[serde(default)]
    pub video_ids: Vec<String>,
    #[serde(default)]
    pub positions: Vec<usize>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub max_items: Option<usize>,
    #[serde(default)]
    pub reverse: bool,
}

impl PlaylistSelection {
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(AppError::Validation(format!(
                    "Playlist range start ({}) is after end ({})",
                    start, end
                )));
            }
        }
        if self.max_items == Some(0) {
            return Err(AppError::Validation("max_items must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn apply(&self, entries: Vec<PlaylistEntry>) -> Vec<PlaylistEntry> {
        let mut selected: Vec<PlaylistEntry> = if self.video_ids.is_empty() && self.positions.is_empty() {
            entries
        } else {
            entries
                .into_iter()
                .enumerate()
                .filter(|(position, entry)| self.positions.contains(position) || self.video_ids.contains(&entry.id))
                .map(|(_, entry)| entry)
                .collect()
        };

        if let Some(start) = self.start {
            let start = start.min(selected.len());
            selected.drain(..start);
        }

        if let Some(end) = self.end {
            // `end` indexes the original range, so shift it by what `start` removed
            let keep = end.saturating_sub(self.start.unwrap_or(0)) + 1;
            selected.truncate(keep);
        }

        if let Some(max) = self.max_items {
            selected.truncate(max);
        }

        if self.reverse {
            selected.reverse();
        }
        selected
    }
}
