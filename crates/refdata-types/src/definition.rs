use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one reference stream load.
///
/// A reference stream is the output of a pipeline run over a single source
/// stream part. Two loads of the same stream through the same pipeline
/// version produce the same definition, which is what makes loads idempotent
/// and lets callers skip streams that are already loaded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefStreamDefinition {
    /// Pipeline that produced the reference data.
    pub pipeline_uuid: Uuid,
    /// Version of the pipeline document at load time.
    pub pipeline_version: String,
    /// Source stream id.
    pub stream_id: i64,
    /// Part of a multi-part stream, zero based.
    pub part_index: i64,
}

impl RefStreamDefinition {
    pub fn new(
        pipeline_uuid: Uuid,
        pipeline_version: impl Into<String>,
        stream_id: i64,
        part_index: i64,
    ) -> Self {
        Self {
            pipeline_uuid,
            pipeline_version: pipeline_version.into(),
            stream_id,
            part_index,
        }
    }

    /// Convenience for single-part streams.
    pub fn single_part(
        pipeline_uuid: Uuid,
        pipeline_version: impl Into<String>,
        stream_id: i64,
    ) -> Self {
        Self::new(pipeline_uuid, pipeline_version, stream_id, 0)
    }

    /// Definition of the named map within this stream.
    pub fn map(&self, map_name: impl Into<String>) -> MapDefinition {
        MapDefinition::new(self.clone(), map_name)
    }
}

impl fmt::Display for RefStreamDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {}:{} (pipeline {} v{})",
            self.stream_id, self.part_index, self.pipeline_uuid, self.pipeline_version
        )
    }
}

/// One named lookup map within a reference stream.
///
/// Field order matters: the serialized form starts with the serialized
/// [`RefStreamDefinition`], so all maps of a stream share a key prefix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapDefinition {
    pub ref_stream_definition: RefStreamDefinition,
    pub map_name: String,
}

impl MapDefinition {
    pub fn new(ref_stream_definition: RefStreamDefinition, map_name: impl Into<String>) -> Self {
        Self {
            ref_stream_definition,
            map_name: map_name.into(),
        }
    }

    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    pub fn ref_stream_definition(&self) -> &RefStreamDefinition {
        &self.ref_stream_definition
    }
}

impl fmt::Display for MapDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map '{}' of {}", self.map_name, self.ref_stream_definition)
    }
}
