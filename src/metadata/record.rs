//! The series record wire type.
//!
//! Field names mirror the archive's JSON responses verbatim (spaces
//! included); numeric quantities arrive as strings and are parsed on
//! demand. A record is created by the resolver and immutable afterward.

use serde::{Deserialize, Serialize};

/// Metadata for one imaging series, the unit of work for the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    /// Unique series identifier; the key for cache files and output paths.
    #[serde(rename = "Series UID", default)]
    pub series_uid: String,

    /// Parent study identifier.
    #[serde(rename = "Study UID", default)]
    pub study_uid: String,

    /// Subject (patient) identifier.
    #[serde(rename = "Subject ID", default)]
    pub subject_id: String,

    /// Collection (dataset) name.
    #[serde(rename = "Collection", default)]
    pub collection: String,

    #[serde(rename = "Study Date", default)]
    pub study_date: String,

    #[serde(rename = "Study Description", default)]
    pub study_description: String,

    #[serde(rename = "Series Description", default)]
    pub series_description: String,

    #[serde(rename = "Series Number", default)]
    pub series_number: String,

    #[serde(rename = "Modality", default)]
    pub modality: String,

    #[serde(rename = "Manufacturer", default)]
    pub manufacturer: String,

    #[serde(rename = "SOP Class UID", default)]
    pub sop_class_uid: String,

    #[serde(rename = "Number of Images", default)]
    pub number_of_images: String,

    /// Total *uncompressed* size in bytes, as reported by the archive.
    /// The archive body is compressed, so this is a hint for the extracted
    /// layout, never for the transfer itself.
    #[serde(rename = "File Size", default)]
    pub file_size: String,

    #[serde(rename = "Data Description URI", default)]
    pub data_description_uri: String,

    #[serde(rename = "License Name", default)]
    pub license_name: String,

    #[serde(rename = "License URL", default)]
    pub license_url: String,

    #[serde(rename = "Annotation Size", default)]
    pub annotation_size: String,

    #[serde(rename = "3rd Party Analysis", default)]
    pub third_party_analysis: String,
}

impl SeriesRecord {
    /// Declared uncompressed size in bytes, when the archive reported one.
    #[must_use]
    pub fn file_size_bytes(&self) -> Option<u64> {
        self.file_size.trim().parse().ok()
    }
}

/// Metadata responses are an array of records, except that single-series
/// queries sometimes come back as a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MetadataPayload {
    /// The usual array form.
    Many(Vec<SeriesRecord>),
    /// The single-object form.
    One(Box<SeriesRecord>),
}

impl MetadataPayload {
    /// Normalizes either form to a sequence of records.
    #[must_use]
    pub fn into_records(self) -> Vec<SeriesRecord> {
        match self {
            Self::Many(records) => records,
            Self::One(record) => vec![*record],
        }
    }
}
