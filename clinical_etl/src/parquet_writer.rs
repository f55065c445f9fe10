use arrow::{
    array::{ArrayRef, ArrayBuilder, Float64Builder, Int64Builder, StringBuilder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::{basic::Compression, file::properties::WriterProperties};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    common::{ensure_parent_dir, tmp_path_for},
    error::{EtlError, Result},
    table::{ColumnKind, Value},
};

enum ColumnBuilder {
    Text(StringBuilder),
    Int(Int64Builder),
    Float(Float64Builder),
}

impl ColumnBuilder {
    fn for_kind(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Integer => ColumnBuilder::Int(Int64Builder::new()),
            ColumnKind::Float => ColumnBuilder::Float(Float64Builder::new()),
            ColumnKind::Text | ColumnKind::Date => ColumnBuilder::Text(StringBuilder::new()),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            ColumnBuilder::Text(_) => DataType::Utf8,
            ColumnBuilder::Int(_) => DataType::Int64,
            ColumnBuilder::Float(_) => DataType::Float64,
        }
    }

    fn append(&mut self, value: &Value) {
        match (self, value) {
            (ColumnBuilder::Text(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Text(b), other) => b.append_value(other.render()),
            (ColumnBuilder::Int(b), Value::Int(i)) => b.append_value(*i),
            (ColumnBuilder::Int(b), _) => b.append_null(),
            (ColumnBuilder::Float(b), other) => b.append_option(other.as_f64()),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
            ColumnBuilder::Int(b) => Arc::new(b.finish()),
            ColumnBuilder::Float(b) => Arc::new(b.finish()),
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnBuilder::Text(b) => b.len(),
            ColumnBuilder::Int(b) => b.len(),
            ColumnBuilder::Float(b) => b.len(),
        }
    }
}

/// Batched Parquet writer with one Utf8, Int64 or Float64 column per field.
///
/// Rows go to `<output>.tmp`; `finish` renames it over the output, `abort`
/// removes it so a failed run never replaces a good file.
pub struct TypedParquetWriter {
    output_path: PathBuf,
    tmp_path: PathBuf,
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,
    builders: Vec<ColumnBuilder>,
    batch_size: usize,
}

impl TypedParquetWriter {
    pub fn try_new(
        output_path: &Path,
        columns: &[(&str, ColumnKind)],
        batch_size: usize,
    ) -> Result<Self> {
        ensure_parent_dir(output_path)?;
        let tmp_path = tmp_path_for(output_path);
        let target = output_path.display().to_string();

        let builders: Vec<ColumnBuilder> = columns
            .iter()
            .map(|(_, kind)| ColumnBuilder::for_kind(*kind))
            .collect();
        let fields: Vec<Field> = columns
            .iter()
            .zip(&builders)
            .map(|((name, _), builder)| Field::new(*name, builder.data_type(), true))
            .collect();
        let schema = Arc::new(Schema::new(fields));

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let file = File::create(&tmp_path).map_err(|e| {
            EtlError::sink(&target, format!("creating {}: {e}", tmp_path.display()))
        })?;
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
            .map_err(|e| EtlError::sink(&target, format!("creating ArrowWriter: {e}")))?;

        Ok(Self {
            output_path: output_path.to_path_buf(),
            tmp_path,
            schema,
            writer,
            builders,
            batch_size: batch_size.max(1),
        })
    }

    fn target(&self) -> String {
        self.output_path.display().to_string()
    }

    pub fn push_row(&mut self, values: &[&Value]) -> Result<()> {
        if values.len() != self.builders.len() {
            return Err(EtlError::sink(
                self.target(),
                format!(
                    "push_row expected {} columns, got {}",
                    self.builders.len(),
                    values.len()
                ),
            ));
        }
        for (builder, value) in self.builders.iter_mut().zip(values) {
            builder.append(value);
        }
        if self.builders.first().map(ColumnBuilder::len).unwrap_or(0) >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.flush_batch()?;
        let target = self.target();
        self.writer
            .close()
            .map_err(|e| EtlError::sink(&target, format!("closing Parquet writer: {e}")))?;
        fs::rename(&self.tmp_path, &self.output_path).map_err(|e| {
            EtlError::sink(
                &target,
                format!("moving {} into place: {e}", self.tmp_path.display()),
            )
        })?;
        Ok(())
    }

    pub fn abort(self) {
        let _ = self.writer.close();
        let _ = fs::remove_file(&self.tmp_path);
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.builders.first().map(ColumnBuilder::len).unwrap_or(0) == 0 {
            return Ok(());
        }
        let target = self.target();
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .map_err(|e| EtlError::sink(&target, format!("building RecordBatch: {e}")))?;
        self.writer
            .write(&batch)
            .map_err(|e| EtlError::sink(&target, format!("writing RecordBatch: {e}")))?;
        Ok(())
    }
}
