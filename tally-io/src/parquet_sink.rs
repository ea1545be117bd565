#![cfg(feature = "parquet")]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use arrow::array::{
    ArrayRef, Float64Builder, Int64Builder, StringBuilder, TimestampMillisecondBuilder, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tally_core::{Error, Result, Sink, WindowResult};
use tracing::debug;

use crate::{output_path, tmp_path};

#[derive(Clone, Debug)]
pub struct ParquetSinkConfig {
    pub out_dir: PathBuf,
    /// Optional compression: none|snappy|zstd (default: snappy)
    pub compression: Option<String>,
}

impl Default for ParquetSinkConfig {
    fn default() -> Self {
        Self { out_dir: PathBuf::from("./out/aggregated_data"), compression: Some("snappy".into()) }
    }
}

/// Writes each finalized window as a single-row parquet file under
/// `out_dir/dt=YYYY-MM-DD/`, named after the window key.
pub struct ParquetSink {
    cfg: ParquetSinkConfig,
    schema: SchemaRef,
}

impl ParquetSink {
    pub fn new(cfg: ParquetSinkConfig) -> Self {
        let ts = DataType::Timestamp(TimeUnit::Millisecond, None);
        let fields = vec![
            Field::new("invoice_no", DataType::Utf8, false),
            Field::new("customer_id", DataType::Utf8, false),
            Field::new("country", DataType::Utf8, false),
            Field::new("window_start", ts.clone(), false),
            Field::new("window_end", ts, false),
            Field::new("total_quantity", DataType::Int64, false),
            Field::new("total_price", DataType::Float64, false),
            Field::new("record_count", DataType::UInt64, false),
        ];
        Self { cfg, schema: Arc::new(Schema::new(fields)) }
    }

    pub fn path_for(&self, result: &WindowResult) -> PathBuf {
        output_path(&self.cfg.out_dir, &result.key, "parquet")
    }

    fn build_batch(&self, results: &[&WindowResult]) -> Result<RecordBatch> {
        let mut invoice = StringBuilder::new();
        let mut customer = StringBuilder::new();
        let mut country = StringBuilder::new();
        let mut start = TimestampMillisecondBuilder::new();
        let mut end = TimestampMillisecondBuilder::new();
        let mut qty = Int64Builder::new();
        let mut price = Float64Builder::new();
        let mut count = UInt64Builder::new();
        for r in results {
            let g = &r.key.group;
            invoice.append_value(&g.invoice_no);
            customer.append_value(&g.customer_id);
            country.append_value(&g.country);
            start.append_value(r.key.window.start.as_millis());
            end.append_value(r.key.window.end.as_millis());
            qty.append_value(r.totals.total_quantity);
            price.append_value(r.totals.total_price);
            count.append_value(r.totals.record_count);
        }
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(invoice.finish()),
            Arc::new(customer.finish()),
            Arc::new(country.finish()),
            Arc::new(start.finish()),
            Arc::new(end.finish()),
            Arc::new(qty.finish()),
            Arc::new(price.finish()),
            Arc::new(count.finish()),
        ];
        let batch = RecordBatch::try_new(self.schema.clone(), arrays).context("record batch")?;
        Ok(batch)
    }

    fn properties(&self) -> WriterProperties {
        let mut builder = WriterProperties::builder();
        match self.cfg.compression.as_deref().unwrap_or("snappy").to_lowercase().as_str() {
            "snappy" => {
                builder = builder.set_compression(parquet::basic::Compression::SNAPPY);
            }
            "zstd" => {
                builder = builder
                    .set_compression(parquet::basic::Compression::ZSTD(parquet::basic::ZstdLevel::default()));
            }
            _ => {
                builder = builder.set_compression(parquet::basic::Compression::UNCOMPRESSED);
            }
        }
        builder.build()
    }

    fn write_file(&self, path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
        let dir = path.parent().context("output path has no parent")?;
        std::fs::create_dir_all(dir).context("creating output directory")?;
        let tmp = tmp_path(path);
        let file = std::fs::File::create(&tmp).context("creating temp file")?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), Some(self.properties()))?;
        writer.write(batch)?;
        let file = writer.into_inner()?;
        file.sync_all().context("syncing temp file")?;
        drop(file);
        std::fs::rename(&tmp, path).context("renaming into place")?;
        #[cfg(unix)]
        std::fs::File::open(dir).and_then(|d| d.sync_all()).context("syncing output directory")?;
        Ok(())
    }
}

#[async_trait]
impl Sink for ParquetSink {
    async fn emit(&self, result: &WindowResult) -> Result<()> {
        let path = self.path_for(result);
        let batch = self.build_batch(&[result])?;
        self.write_file(&path, &batch)
            .map_err(|e| Error::Sink(format!("{}: {e:#}", path.display())))?;
        let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        tally_core::metrics::BYTES_WRITTEN.with_label_values(&["parquet"]).inc_by(bytes);
        debug!(path = %path.display(), "window written");
        Ok(())
    }
}
