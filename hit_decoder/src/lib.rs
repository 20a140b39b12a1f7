/*!
# Hit Decoder - AstroPix readouts for Python analysis

Python extension exposing the readout scanner and hit decoder. Decoded hits
come back as a dict of numpy arrays keyed by column name, in the column order
of the hit record schema, ready for `pandas.DataFrame(...)`.

## Usage

```python
import hit_decoder

decoder = hit_decoder.Decoder(chip_version=3, nchips=1)
columns = decoder.decode(readout_bytes, readout=12)
print(columns["tot_us"])
```
*/

use astropix::decode::{TimestampHit, TotHit};
use astropix::{ChipVersion, ClockMode, DecodedHit, Error, HitLayout, ReadoutDecoder};
use numpy::ToPyArray;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use pyo3::Bound;

fn to_py_err(err: Error) -> PyErr {
    match err {
        Error::DecodeFault { .. } | Error::Config(_) | Error::OutOfRange { .. } => {
            PyValueError::new_err(err.to_string())
        }
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

/// Add one numpy column built from a field of every hit
macro_rules! column {
    ($py:expr, $dict:expr, $hits:expr, $name:expr, $field:ident) => {
        $dict.set_item(
            $name,
            $hits.iter().map(|h| h.$field).collect::<Vec<_>>().to_pyarray_bound($py),
        )?;
    };
}

fn tot_columns<'py>(py: Python<'py>, hits: &[&TotHit]) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new_bound(py);
    column!(py, dict, hits, "readout", readout);
    column!(py, dict, hits, "Chip ID", chip_id);
    column!(py, dict, hits, "payload", payload);
    column!(py, dict, hits, "location", location);
    column!(py, dict, hits, "isCol", is_col);
    column!(py, dict, hits, "timestamp", timestamp);
    column!(py, dict, hits, "tot_msb", tot_msb);
    column!(py, dict, hits, "tot_lsb", tot_lsb);
    column!(py, dict, hits, "tot_total", tot_total);
    column!(py, dict, hits, "tot_us", tot_us);
    column!(py, dict, hits, "hittime", hittime);
    Ok(dict)
}

fn timestamp_columns<'py>(py: Python<'py>, hits: &[&TimestampHit]) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new_bound(py);
    column!(py, dict, hits, "id", id);
    column!(py, dict, hits, "payload", payload);
    column!(py, dict, hits, "row", row);
    column!(py, dict, hits, "col", col);
    column!(py, dict, hits, "ts1", ts1);
    column!(py, dict, hits, "tsfine1", tsfine1);
    column!(py, dict, hits, "ts2", ts2);
    column!(py, dict, hits, "tsfine2", tsfine2);
    column!(py, dict, hits, "tsneg1", tsneg1);
    column!(py, dict, hits, "tsneg2", tsneg2);
    column!(py, dict, hits, "tstdc1", tstdc1);
    column!(py, dict, hits, "tstdc2", tstdc2);
    column!(py, dict, hits, "ts_dec1", ts_dec1);
    column!(py, dict, hits, "ts_dec2", ts_dec2);
    column!(py, dict, hits, "tot_us", tot_us);
    Ok(dict)
}

/// Readout decoder for one daisy chain
#[pyclass(name = "Decoder")]
pub struct PyDecoder {
    inner: ReadoutDecoder,
    layout: HitLayout,
}

#[pymethods]
impl PyDecoder {
    #[new]
    #[pyo3(signature = (chip_version, nchips=1, sampleclock_period_ns=5.0, reverse_bitorder=true, prefilter=false))]
    fn new(
        chip_version: u8,
        nchips: usize,
        sampleclock_period_ns: f64,
        reverse_bitorder: bool,
        prefilter: bool,
    ) -> PyResult<Self> {
        let version = ChipVersion::new(chip_version).map_err(to_py_err)?;
        let inner = ReadoutDecoder::for_chip(version, nchips, sampleclock_period_ns, reverse_bitorder)
            .map_err(to_py_err)?
            .with_prefilter(prefilter);
        Ok(Self {
            inner,
            layout: HitLayout::for_version(version),
        })
    }

    /// Decode one readout
    ///
    /// Args:
    ///     data: Raw readout bytes
    ///     readout: Readout number stored with every hit
    ///     offline: Store 0.0 instead of the current time as capture time
    ///
    /// Returns:
    ///     dict of numpy arrays, one per column
    ///
    /// Raises:
    ///     ValueError: The readout failed the stream pre-filter
    #[pyo3(signature = (data, readout=0, offline=false))]
    fn decode<'py>(
        &self,
        py: Python<'py>,
        data: &[u8],
        readout: u64,
        offline: bool,
    ) -> PyResult<Bound<'py, PyDict>> {
        let clock = if offline { ClockMode::Offline } else { ClockMode::Live };
        let hits = py
            .allow_threads(|| self.inner.decode_readout(data, readout, clock))
            .map_err(to_py_err)?;
        tracing::debug!("Decoded {} hits from readout {}", hits.len(), readout);

        match self.layout {
            HitLayout::FiveByte => {
                let tot: Vec<&TotHit> = hits
                    .iter()
                    .filter_map(|hit| match hit {
                        DecodedHit::Tot(h) => Some(h),
                        DecodedHit::Timestamp(_) => None,
                    })
                    .collect();
                tot_columns(py, &tot)
            }
            HitLayout::EightByte => {
                let ts: Vec<&TimestampHit> = hits
                    .iter()
                    .filter_map(|hit| match hit {
                        DecodedHit::Timestamp(h) => Some(h),
                        DecodedHit::Tot(_) => None,
                    })
                    .collect();
                timestamp_columns(py, &ts)
            }
        }
    }

    /// On-wire header byte of every chip in the chain
    fn headers(&self) -> Vec<u8> {
        self.inner.scanner().headers().values().to_vec()
    }

    /// Column names in output order
    #[getter]
    fn columns(&self) -> Vec<&'static str> {
        self.layout.columns().to_vec()
    }

    #[getter]
    fn frame_length(&self) -> usize {
        self.layout.frame_length()
    }
}

/// Python module definition
#[pymodule]
fn hit_decoder(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyDecoder>()?;
    m.add("__version__", astropix::VERSION)?;

    // Add module docstring
    m.add("__doc__", "AstroPix readout decoding into numpy columns")?;

    Ok(())
}
