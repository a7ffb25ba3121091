// src/formats/npy.rs
//
// NumPy `.npy` arrays, the on-disk form of the training datasets
// (`box`, `coord`, `energy`, `force` under `set.000/`).
//
// Only what the datasets use is supported: C-ordered little-endian `f8`
// (read and write) and `f4` (read, widened to f64). Format versions 1.0 to 3.0.

use crate::errors::{PipelineError, PipelineResult};
use std::fs;
use std::io::Read;
use std::path::Path;

const MAGIC: &[u8] = b"\x93NUMPY";

/// Bytes read up front by `read_shape`.
const HEADER_PEEK: usize = 1024;

/// Number of elements of `shape`, or `None` on overflow.
fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NpyArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> PipelineResult<Self> {
        let expected = element_count(&shape).ok_or_else(|| {
            PipelineError::InvalidArgument(format!("shape {:?} overflows", shape))
        })?;
        if expected != data.len() {
            return Err(PipelineError::InvalidArgument(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Size of the leading axis (number of frames for dataset arrays).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the array data.
    pub data_offset: usize,
}

/// Byte range of the header dict, from the fixed preamble alone.
fn header_span(bytes: &[u8], origin: &Path) -> PipelineResult<(usize, usize)> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(PipelineError::parse(origin, "not a .npy file (bad magic)"));
    }
    let (header_len, start): (usize, usize) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(PipelineError::parse(origin, "truncated header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(PipelineError::parse(origin, format!("unsupported npy version {}", v))),
    };
    let end = start
        .checked_add(header_len)
        .ok_or_else(|| PipelineError::parse(origin, "header length overflows"))?;
    Ok((start, end))
}

pub fn parse_header(bytes: &[u8], origin: &Path) -> PipelineResult<NpyHeader> {
    let (start, end) = header_span(bytes, origin)?;
    if bytes.len() < end {
        return Err(PipelineError::parse(origin, "truncated header"));
    }
    let dict = std::str::from_utf8(&bytes[start..end])
        .map_err(|_| PipelineError::parse(origin, "header is not text"))?;

    let descr = dict_value(dict, "descr")
        .map(|v| v.trim_matches(|c| c == '\'' || c == '"').to_string())
        .ok_or_else(|| PipelineError::parse(origin, "header lacks `descr`"))?;
    let fortran_order = dict_value(dict, "fortran_order")
        .map(|v| v.starts_with("True"))
        .unwrap_or(false);
    let shape_txt = dict_value(dict, "shape")
        .ok_or_else(|| PipelineError::parse(origin, "header lacks `shape`"))?;
    let shape = shape_txt
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| PipelineError::parse(origin, format!("bad shape entry `{}`", s)))
        })
        .collect::<PipelineResult<Vec<_>>>()?;

    Ok(NpyHeader {
        descr,
        fortran_order,
        shape,
        data_offset: end,
    })
}

/// Raw text of `key`'s value in the header dict, e.g. `(10, 3)` or `'<f8'`.
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let pat_single = format!("'{}':", key);
    let pat_double = format!("\"{}\":", key);
    let at = dict
        .find(&pat_single)
        .map(|i| i + pat_single.len())
        .or_else(|| dict.find(&pat_double).map(|i| i + pat_double.len()))?;
    let rest = dict[at..].trim_start();
    let len = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find(|c| c == ',' || c == '}').unwrap_or(rest.len())
    };
    Some(rest[..len].trim())
}

/// Reads only the header; enough to count structures in a dataset.
pub fn read_shape(path: &Path) -> PipelineResult<Vec<usize>> {
    let mut file = fs::File::open(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
    let io_err = |e: std::io::Error| PipelineError::parse(path, e.to_string());

    let mut head = Vec::with_capacity(HEADER_PEEK);
    file.by_ref()
        .take(HEADER_PEEK as u64)
        .read_to_end(&mut head)
        .map_err(io_err)?;
    let (_, end) = header_span(&head, path)?;
    if head.len() < end {
        file.by_ref()
            .take((end - head.len()) as u64)
            .read_to_end(&mut head)
            .map_err(io_err)?;
    }
    Ok(parse_header(&head, path)?.shape)
}

pub fn decode(bytes: &[u8], origin: &Path) -> PipelineResult<NpyArray> {
    let header = parse_header(bytes, origin)?;
    if header.fortran_order {
        return Err(PipelineError::parse(origin, "fortran-ordered arrays are not supported"));
    }
    let count = element_count(&header.shape)
        .ok_or_else(|| PipelineError::parse(origin, format!("shape {:?} overflows", header.shape)))?;
    let body = &bytes[header.data_offset..];
    let short = || PipelineError::parse(origin, "array body shorter than shape");

    let data = match header.descr.as_str() {
        "<f8" => {
            if body.len() < count.checked_mul(8).ok_or_else(short)? {
                return Err(short());
            }
            body.chunks_exact(8)
                .take(count)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect()
        }
        "<f4" => {
            if body.len() < count.checked_mul(4).ok_or_else(short)? {
                return Err(short());
            }
            body.chunks_exact(4)
                .take(count)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect()
        }
        other => {
            return Err(PipelineError::parse(origin, format!("unsupported dtype `{}`", other)));
        }
    };
    NpyArray::new(header.shape, data)
}

pub fn read(path: &Path) -> PipelineResult<NpyArray> {
    let bytes = fs::read(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
    decode(&bytes, path)
}

/// Serializes as format 1.0, `<f8`, header padded to 64 bytes.
pub fn encode(array: &NpyArray) -> Vec<u8> {
    let shape = match array.shape.len() {
        1 => format!("({},)", array.shape[0]),
        _ => format!(
            "({})",
            array
                .shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut dict = format!("{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}", shape);
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    dict.push_str(&" ".repeat(pad));
    dict.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + dict.len() + array.data.len() * 8);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    for v in &array.data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn write(path: &Path, array: &NpyArray) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encode(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_aligned() {
        let arr = NpyArray::new(vec![2, 9], vec![0.5; 18]).unwrap();
        let bytes = encode(&arr);
        let header = parse_header(&bytes, Path::new("box.npy")).unwrap();
        assert_eq!(header.data_offset % 64, 0);
        assert_eq!(header.shape, vec![2, 9]);
        assert_eq!(header.descr, "<f8");
    }

    #[test]
    fn test_decode_numpy_written_header() {
        // Header as produced by numpy for np.zeros(3, dtype='<f4').
        let dict = "{'descr': '<f4', 'fortran_order': False, 'shape': (3,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        for v in [1.5f32, -2.0, 0.25] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let arr = decode(&bytes, Path::new("energy.npy")).unwrap();
        assert_eq!(arr.shape, vec![3]);
        assert_eq!(arr.data, vec![1.5, -2.0, 0.25]);
        assert_eq!(arr.rows(), 3);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(NpyArray::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    fn v1_bytes(dict: &str, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_overflowing_shape_is_parse_error() {
        let dict = "{'descr': '<f8', 'fortran_order': False, 'shape': (4294967296, 4294967296, 4294967296), }";
        let err = decode(&v1_bytes(dict, &[0u8; 16]), Path::new("force.npy")).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
        // Fits in usize, but not once multiplied by the item size.
        let dict = format!("{{'descr': '<f8', 'fortran_order': False, 'shape': ({},), }}", usize::MAX / 4);
        let err = decode(&v1_bytes(&dict, &[0u8; 16]), Path::new("force.npy")).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[test]
    fn test_read_shape_reads_header_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("box.npy");
        write(&path, &NpyArray::new(vec![500, 9], vec![1.0; 4500]).unwrap()).unwrap();
        assert_eq!(read_shape(&path).unwrap(), vec![500, 9]);

        // A header longer than the initial peek.
        let dict = format!("{{'descr': '<f8', 'fortran_order': False, 'shape': (2,), }}{}", " ".repeat(3000));
        let long = tmp.path().join("energy.npy");
        fs::write(&long, v1_bytes(&dict, &[0u8; 16])).unwrap();
        assert_eq!(read_shape(&long).unwrap(), vec![2]);

        fs::write(tmp.path().join("short.npy"), &MAGIC[..4]).unwrap();
        assert!(read_shape(&tmp.path().join("short.npy")).is_err());
    }

    #[test]
    fn test_bad_magic() {
        assert!(decode(b"PK\x03\x04 not numpy", Path::new("x.npy")).is_err());
    }
}
