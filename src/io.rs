//! Export of recorded traces to CSV, Arrow IPC and Parquet files.
//!
//! Every writer takes the per-chain arrays of one trace key, as found in
//! [`ChainsOutput::traces`](crate::sampler::ChainsOutput), and writes one row
//! per chain and sample with the columns `chain`, `sample`, `dim_0`, `dim_1`,
//! and so on. Values of more than one dimension are flattened in row-major
//! order. Chains may have different lengths, as left by an interrupted run.

#[cfg(any(feature = "csv", feature = "arrow"))]
use std::error::Error;
#[cfg(any(feature = "csv", feature = "arrow"))]
use std::fs::File;

#[cfg(any(feature = "csv", feature = "arrow"))]
use crate::persist::TraceArray;

#[cfg(feature = "csv")]
use csv::Writer;

#[cfg(feature = "parquet")]
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};

#[cfg(feature = "arrow")]
use arrow::{
    array::{ArrayRef, Float64Builder, UInt32Builder},
    datatypes::{DataType, Field, Schema},
    ipc::writer::FileWriter,
    record_batch::RecordBatch,
};
#[cfg(feature = "arrow")]
use std::sync::Arc;

/// Number of flattened values per sample shared by all chains.
#[cfg(any(feature = "csv", feature = "arrow"))]
fn common_width(traces: &[TraceArray]) -> Result<usize, Box<dyn Error>> {
    let mut width = None;
    for trace in traces {
        let w: usize = trace.shape()[1..].iter().product();
        match width {
            None => width = Some(w),
            Some(expected) if expected != w => {
                return Err("Inconsistent sample dimensions among chains".into())
            }
            Some(_) => {}
        }
    }
    Ok(width.unwrap_or(0))
}

/// Calls `f(chain, sample, values)` for every recorded sample.
#[cfg(any(feature = "csv", feature = "arrow"))]
fn for_each_row<F>(traces: &[TraceArray], mut f: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut(usize, usize, &[f64]) -> Result<(), Box<dyn Error>>,
{
    for (chain_idx, trace) in traces.iter().enumerate() {
        let view = trace.view();
        let view = view.as_standard_layout();
        let n_rows = trace.len();
        let data = view
            .as_slice()
            .ok_or("Expected trace data in standard layout")?;
        let width = if n_rows == 0 { 0 } else { data.len() / n_rows };
        for sample_idx in 0..n_rows {
            f(
                chain_idx,
                sample_idx,
                &data[sample_idx * width..(sample_idx + 1) * width],
            )?;
        }
    }
    Ok(())
}

#[cfg(feature = "csv")]
/// Saves the per-chain arrays of one trace as a CSV file.
///
/// The file has a header row `chain,sample,dim_0,...`; with no chains it
/// holds just `chain,sample`.
///
/// # Examples
///
/// ```rust
/// # use mini_hmc::io::save_trace_csv;
/// # use mini_hmc::persist::TraceArray;
/// use ndarray::arr2;
///
/// let traces = vec![TraceArray::Memory(arr2(&[[42.0]]).into_dyn())];
/// save_trace_csv(&traces, "/tmp/output.csv")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn save_trace_csv(traces: &[TraceArray], filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let num_dimensions = common_width(traces)?;
    let mut header: Vec<String> = vec!["chain".to_string(), "sample".to_string()];
    header.extend((0..num_dimensions).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;

    for_each_row(traces, |chain_idx, sample_idx, values| {
        let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
        row.extend(values.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
        Ok(())
    })?;

    wtr.flush()?;
    Ok(())
}

/// Builds a record batch `chain (UInt32), sample (UInt32), dim_i (Float64)`.
#[cfg(feature = "arrow")]
fn trace_record_batch(traces: &[TraceArray]) -> Result<RecordBatch, Box<dyn Error>> {
    let n_dims = common_width(traces)?;

    let mut fields = vec![
        Field::new("chain", DataType::UInt32, false),
        Field::new("sample", DataType::UInt32, false),
    ];
    for dim_idx in 0..n_dims {
        fields.push(Field::new(
            format!("dim_{}", dim_idx),
            DataType::Float64,
            false,
        ));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut chain_builder = UInt32Builder::new();
    let mut sample_builder = UInt32Builder::new();
    let mut dim_builders: Vec<Float64Builder> =
        (0..n_dims).map(|_| Float64Builder::new()).collect();

    for_each_row(traces, |chain_idx, sample_idx, values| {
        chain_builder.append_value(chain_idx as u32);
        sample_builder.append_value(sample_idx as u32);
        for (builder, &val) in dim_builders.iter_mut().zip(values) {
            builder.append_value(val);
        }
        Ok(())
    })?;

    let mut arrays = vec![
        Arc::new(chain_builder.finish()) as ArrayRef,
        Arc::new(sample_builder.finish()) as ArrayRef,
    ];
    for mut builder in dim_builders {
        arrays.push(Arc::new(builder.finish()) as ArrayRef);
    }
    Ok(RecordBatch::try_new(schema, arrays)?)
}

#[cfg(feature = "arrow")]
/// Saves the per-chain arrays of one trace as an Apache Arrow IPC file.
pub fn save_trace_arrow(traces: &[TraceArray], filename: &str) -> Result<(), Box<dyn Error>> {
    let record_batch = trace_record_batch(traces)?;
    let file = File::create(filename)?;
    let mut writer = FileWriter::try_new(file, &record_batch.schema())?;
    writer.write(&record_batch)?;
    writer.finish()?;
    Ok(())
}

#[cfg(feature = "parquet")]
/// Saves the per-chain arrays of one trace to a Parquet file.
///
/// # Example
///
/// ```rust
/// # use mini_hmc::io::save_trace_parquet;
/// # use mini_hmc::persist::TraceArray;
/// use ndarray::arr1;
///
/// let traces = vec![TraceArray::Memory(arr1(&[1.0, 2.0]).into_dyn())];
/// save_trace_parquet(&traces, "/tmp/output.parquet")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn save_trace_parquet(traces: &[TraceArray], filename: &str) -> Result<(), Box<dyn Error>> {
    let record_batch = trace_record_batch(traces)?;
    let file = File::create(filename)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, record_batch.schema(), Some(props))?;
    writer.write(&record_batch)?;
    // Close the writer to ensure metadata is written
    writer.close()?;
    Ok(())
}
