use std::sync::Arc;

/// Contents of one row of the probe table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowImage {
    /// The mutable free-text field.
    pub text: String,
    /// The secondary field range predicates select on.
    pub marker: Option<String>,
}

impl RowImage {
    pub fn new(text: impl Into<String>, marker: Option<String>) -> Self {
        Self {
            text: text.into(),
            marker,
        }
    }

    pub fn has_marker(&self, marker: &str) -> bool {
        self.marker.as_deref() == Some(marker)
    }
}

/// A committed row state together with the commit timestamp that produced
/// it. A missing image is a tombstone left by a committed delete.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRow {
    image: Option<Arc<RowImage>>,
    version: u64,
}

impl VersionedRow {
    pub fn new(image: Option<Arc<RowImage>>, version: u64) -> Self {
        Self { image, version }
    }

    pub fn image(&self) -> Option<&Arc<RowImage>> {
        self.image.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Committed history of one key, oldest first.
///
/// Repeatable-read and serializable transactions remember the engine clock
/// at their first read of a key and keep reading [`RowHistory::as_of`] that
/// snapshot, so versions stay around until no open transaction can ask for
/// them.
#[derive(Debug, Default)]
pub struct RowHistory {
    versions: Vec<VersionedRow>,
}

impl RowHistory {
    pub fn latest(&self) -> Option<&VersionedRow> {
        self.versions.last()
    }

    /// Latest committed image, `None` if the row never existed or is deleted.
    pub fn current(&self) -> Option<&Arc<RowImage>> {
        self.latest().and_then(VersionedRow::image)
    }

    /// The image a reader whose snapshot was taken at `snapshot` sees.
    pub fn as_of(&self, snapshot: u64) -> Option<&Arc<RowImage>> {
        self.versions
            .iter()
            .rev()
            .find(|row| row.version() <= snapshot)
            .and_then(VersionedRow::image)
    }

    pub fn push(&mut self, row: VersionedRow) {
        self.versions.push(row);
    }

    /// Drops versions no snapshot at or after `horizon` can reach: everything
    /// older than the newest version visible at `horizon`.
    pub fn prune(&mut self, horizon: u64) {
        let visible = self
            .versions
            .iter()
            .rposition(|row| row.version() <= horizon);
        if let Some(keep_from) = visible {
            self.versions.drain(..keep_from);
        }
    }
}
