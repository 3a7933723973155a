//! Parquet object segments: immutable columnar files with schema
//! `(sha: utf8, type: utf8, size: int64, data: optional bytes)`. Rows are
//! sorted by `sha` before writing so every row group carries tight min/max
//! statistics and a point read can prune row groups without scanning them.

use std::sync::Arc;

use bytes::Bytes;
use parquet::{
    basic::{Compression, ConvertedType, Repetition, Type as PhysicalType},
    data_type::{ByteArray, ByteArrayType, Int64Type},
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
        statistics::Statistics,
        writer::SerializedFileWriter,
    },
    record::RowAccessor,
    schema::types::Type as SchemaType,
};

use crate::errors::GitError;

/// One object row as stored in a segment. `data` is `None` for large objects
/// that live in a side blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRow {
    pub sha: String,
    pub otype: String,
    pub size: i64,
    pub data: Option<Vec<u8>>,
}

fn segment_schema() -> Arc<SchemaType> {
    let sha = SchemaType::primitive_type_builder("sha", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::REQUIRED)
        .with_converted_type(ConvertedType::UTF8)
        .build()
        .expect("static schema");
    let otype = SchemaType::primitive_type_builder("type", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::REQUIRED)
        .with_converted_type(ConvertedType::UTF8)
        .build()
        .expect("static schema");
    let size = SchemaType::primitive_type_builder("size", PhysicalType::INT64)
        .with_repetition(Repetition::REQUIRED)
        .build()
        .expect("static schema");
    let data = SchemaType::primitive_type_builder("data", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::OPTIONAL)
        .build()
        .expect("static schema");
    Arc::new(
        SchemaType::group_type_builder("object_segment")
            .with_fields(vec![Arc::new(sha), Arc::new(otype), Arc::new(size), Arc::new(data)])
            .build()
            .expect("static schema"),
    )
}

fn tombstone_schema() -> Arc<SchemaType> {
    let sha = SchemaType::primitive_type_builder("sha", PhysicalType::BYTE_ARRAY)
        .with_repetition(Repetition::REQUIRED)
        .with_converted_type(ConvertedType::UTF8)
        .build()
        .expect("static schema");
    Arc::new(
        SchemaType::group_type_builder("tombstones")
            .with_fields(vec![Arc::new(sha)])
            .build()
            .expect("static schema"),
    )
}

fn writer_properties(row_group_size: usize) -> Arc<WriterProperties> {
    Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(row_group_size.max(1))
            .build(),
    )
}

/// Serialize rows into a segment file. Rows are re-sorted by `sha`; the
/// caller's order does not matter.
pub fn write_segment(mut rows: Vec<SegmentRow>, row_group_size: usize) -> Result<Bytes, GitError> {
    rows.sort_by(|a, b| a.sha.cmp(&b.sha));

    let mut buf: Vec<u8> = Vec::new();
    let mut writer =
        SerializedFileWriter::new(&mut buf, segment_schema(), writer_properties(row_group_size))?;

    for chunk in rows.chunks(row_group_size.max(1)) {
        let mut rg = writer.next_row_group()?;

        let shas: Vec<ByteArray> = chunk.iter().map(|r| ByteArray::from(r.sha.as_str())).collect();
        let mut col = rg
            .next_column()?
            .ok_or_else(|| GitError::CustomError("segment schema missing sha".to_string()))?;
        col.typed::<ByteArrayType>().write_batch(&shas, None, None)?;
        col.close()?;

        let otypes: Vec<ByteArray> = chunk
            .iter()
            .map(|r| ByteArray::from(r.otype.as_str()))
            .collect();
        let mut col = rg
            .next_column()?
            .ok_or_else(|| GitError::CustomError("segment schema missing type".to_string()))?;
        col.typed::<ByteArrayType>()
            .write_batch(&otypes, None, None)?;
        col.close()?;

        let sizes: Vec<i64> = chunk.iter().map(|r| r.size).collect();
        let mut col = rg
            .next_column()?
            .ok_or_else(|| GitError::CustomError("segment schema missing size".to_string()))?;
        col.typed::<Int64Type>().write_batch(&sizes, None, None)?;
        col.close()?;

        let def_levels: Vec<i16> = chunk.iter().map(|r| i16::from(r.data.is_some())).collect();
        let datas: Vec<ByteArray> = chunk
            .iter()
            .filter_map(|r| r.data.as_ref().map(|d| ByteArray::from(d.clone())))
            .collect();
        let mut col = rg
            .next_column()?
            .ok_or_else(|| GitError::CustomError("segment schema missing data".to_string()))?;
        col.typed::<ByteArrayType>()
            .write_batch(&datas, Some(&def_levels), None)?;
        col.close()?;

        rg.close()?;
    }
    writer.close()?;

    Ok(Bytes::from(buf))
}

/// Point-query one sha inside a segment, pruning row groups whose `sha`
/// statistics exclude it.
pub fn point_query(segment: &Bytes, sha: &str) -> Result<Option<SegmentRow>, GitError> {
    let reader = SerializedFileReader::new(segment.clone())?;
    let meta = reader.metadata();

    for i in 0..meta.num_row_groups() {
        if !row_group_may_contain(meta.row_group(i).column(0).statistics(), sha) {
            continue;
        }
        let rg = reader.get_row_group(i)?;
        for row in rg.get_row_iter(None)? {
            let row = row?;
            let row_sha = row.get_string(0)?;
            // Rows are sorted; past the key means not in this group.
            if row_sha.as_str() > sha {
                break;
            }
            if row_sha.as_str() == sha {
                return Ok(Some(SegmentRow {
                    sha: row_sha.clone(),
                    otype: row.get_string(1)?.clone(),
                    size: row.get_long(2)?,
                    data: row.get_bytes(3).ok().map(|b| b.data().to_vec()),
                }));
            }
        }
    }
    Ok(None)
}

fn row_group_may_contain(stats: Option<&Statistics>, sha: &str) -> bool {
    if let Some(Statistics::ByteArray(s)) = stats
        && let (Some(min), Some(max)) = (s.min_opt(), s.max_opt())
        && let (Ok(min), Ok(max)) = (min.as_utf8(), max.as_utf8())
    {
        return min <= sha && sha <= max;
    }
    // No usable statistics: scan the group.
    true
}

/// All object ids recorded in a segment; used for bloom rebuilds and
/// compaction.
pub fn list_shas(segment: &Bytes) -> Result<Vec<String>, GitError> {
    let reader = SerializedFileReader::new(segment.clone())?;
    let mut shas = Vec::new();
    for row in reader.get_row_iter(None)? {
        shas.push(row?.get_string(0)?.clone());
    }
    Ok(shas)
}

/// Read every row of a segment; the compaction path streams sources through
/// this.
pub fn read_all_rows(segment: &Bytes) -> Result<Vec<SegmentRow>, GitError> {
    let reader = SerializedFileReader::new(segment.clone())?;
    let mut rows = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        rows.push(SegmentRow {
            sha: row.get_string(0)?.clone(),
            otype: row.get_string(1)?.clone(),
            size: row.get_long(2)?,
            data: row.get_bytes(3).ok().map(|b| b.data().to_vec()),
        });
    }
    Ok(rows)
}

/// Serialize a tombstone listing.
pub fn write_tombstones(mut shas: Vec<String>) -> Result<Bytes, GitError> {
    shas.sort();

    let mut buf: Vec<u8> = Vec::new();
    let mut writer =
        SerializedFileWriter::new(&mut buf, tombstone_schema(), writer_properties(shas.len()))?;
    let mut rg = writer.next_row_group()?;
    let values: Vec<ByteArray> = shas.iter().map(|s| ByteArray::from(s.as_str())).collect();
    let mut col = rg
        .next_column()?
        .ok_or_else(|| GitError::CustomError("tombstone schema missing sha".to_string()))?;
    col.typed::<ByteArrayType>()
        .write_batch(&values, None, None)?;
    col.close()?;
    rg.close()?;
    writer.close()?;

    Ok(Bytes::from(buf))
}

/// Read a tombstone listing.
pub fn read_tombstones(segment: &Bytes) -> Result<Vec<String>, GitError> {
    let reader = SerializedFileReader::new(segment.clone())?;
    let mut shas = Vec::new();
    for row in reader.get_row_iter(None)? {
        shas.push(row?.get_string(0)?.clone());
    }
    Ok(shas)
}
