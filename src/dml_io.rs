//! SystemDS matrix files: `text` (1-based `i j v` cells, zeros omitted) and
//! `csv`, each optionally accompanied by a `<file>.mtd` JSON metadata file.

use crate::tensor::Matrix;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MatrixFormat {
    #[default]
    Text,
    Csv,
}

#[derive(Debug, thiserror::Error)]
pub enum DmlIoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid metadata {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Unsupported matrix format \"{0}\"")]
    UnsupportedFormat(String),
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("{path}: a {rows}x{cols} matrix exceeds {} cells", MAX_CELLS)]
    TooLarge {
        path: PathBuf,
        rows: usize,
        cols: usize,
    },
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

/// Largest dense matrix a text file may describe.
pub const MAX_CELLS: usize = 1 << 27;

/// Contents of a SystemDS `.mtd` file. Unknown keys (author, created, ...) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nnz: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sep: Option<String>,
}

impl MatrixMetadata {
    fn for_matrix(matrix: &Matrix, format: MatrixFormat) -> Self {
        let (rows, cols) = matrix.dim();
        let csv = format == MatrixFormat::Csv;
        MatrixMetadata {
            data_type: Some("matrix".to_string()),
            value_type: Some("double".to_string()),
            rows: Some(rows as i64),
            cols: Some(cols as i64),
            nnz: Some(matrix.iter().filter(|x| **x != 0.0).count() as i64),
            format: Some(format.to_string()),
            header: csv.then_some(false),
            sep: csv.then(|| ",".to_string()),
        }
    }

    fn is_scalar(&self) -> bool {
        self.data_type.as_deref() == Some("scalar")
    }

    fn dims(&self) -> Option<(usize, usize)> {
        let rows = usize::try_from(self.rows?).ok()?;
        let cols = usize::try_from(self.cols?).ok()?;
        Some((rows, cols))
    }

    fn matrix_format(&self) -> Result<Option<MatrixFormat>, DmlIoError> {
        match &self.format {
            None => Ok(None),
            Some(name) => MatrixFormat::from_str(name)
                .map(Some)
                .map_err(|_| DmlIoError::UnsupportedFormat(name.clone())),
        }
    }
}

pub fn metadata_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".mtd");
    PathBuf::from(name)
}

pub fn is_metadata_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "mtd")
}

pub fn read_metadata(path: &Path) -> Result<Option<MatrixMetadata>, DmlIoError> {
    let mtd_path = metadata_path(path);
    if !mtd_path.exists() {
        return Ok(None);
    }
    let contents = read_to_string(&mtd_path)?;
    let metadata = serde_json::from_str(&contents).map_err(|source| DmlIoError::Metadata {
        path: mtd_path.clone(),
        source,
    })?;
    Ok(Some(metadata))
}

fn read_to_string(path: &Path) -> Result<String, DmlIoError> {
    fs::read_to_string(path).map_err(|source| DmlIoError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// Multi-part outputs are directories of part files; ordering by name restores row order.
fn read_contents(path: &Path) -> Result<String, DmlIoError> {
    if !path.is_dir() {
        return read_to_string(path);
    }
    let io_err = |source| DmlIoError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut parts = Vec::new();
    for entry in fs::read_dir(path).map_err(io_err)? {
        let part = entry.map_err(io_err)?.path();
        let hidden = part
            .file_name()
            .map(|x| x.to_string_lossy().starts_with(['.', '_']))
            .unwrap_or(true);
        if part.is_file() && !hidden && !is_metadata_file(&part) {
            parts.push(part);
        }
    }
    parts.sort();
    let mut contents = String::new();
    for part in parts {
        contents.push_str(&read_to_string(&part)?);
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
    }
    Ok(contents)
}

/// Reads a matrix, preferring the format recorded in its `.mtd` over `default_format`.
pub fn read_matrix(path: &Path, default_format: MatrixFormat) -> Result<Matrix, DmlIoError> {
    let metadata = read_metadata(path)?.unwrap_or_default();
    let contents = read_contents(path)?;

    if metadata.is_scalar() {
        let value = parse_value(contents.trim()).ok_or_else(|| DmlIoError::Parse {
            path: path.to_path_buf(),
            line: 1,
            message: format!("invalid scalar \"{}\"", contents.trim()),
        })?;
        return Ok(Matrix::from_elem((1, 1), value));
    }

    let format = match metadata.matrix_format()? {
        Some(format) => format,
        None if path.extension().is_some_and(|ext| ext == "csv") => MatrixFormat::Csv,
        None => default_format,
    };
    match format {
        MatrixFormat::Text => parse_text(path, &contents, metadata.dims()),
        MatrixFormat::Csv => parse_csv(
            path,
            &contents,
            metadata.header.unwrap_or(false),
            metadata.sep.as_deref().unwrap_or(","),
        ),
    }
}

/// Parses a single cell. SystemDS writes booleans as `TRUE`/`FALSE` and
/// infinities the Java way.
pub fn parse_value(token: &str) -> Option<f64> {
    match token.to_ascii_lowercase().as_str() {
        "true" => Some(1.0),
        "false" => Some(0.0),
        lowered => lowered.parse::<f64>().ok(),
    }
}

fn format_value(value: f64) -> String {
    if value.is_infinite() {
        let sign = if value < 0.0 { "-" } else { "" };
        format!("{sign}Infinity")
    } else {
        value.to_string()
    }
}

pub fn parse_text(
    path: &Path,
    contents: &str,
    dims: Option<(usize, usize)>,
) -> Result<Matrix, DmlIoError> {
    let parse_err = |line: usize, message: String| DmlIoError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let lines: Vec<(usize, &str)> = contents
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect();

    // A bare value is how scalars come back when no metadata was written
    if dims.is_none()
        && let [(line, only)] = lines.as_slice()
        && !only.contains(char::is_whitespace)
    {
        let value = parse_value(only).ok_or_else(|| parse_err(*line, format!("invalid value \"{only}\"")))?;
        return Ok(Matrix::from_elem((1, 1), value));
    }

    let mut cells = Vec::with_capacity(lines.len());
    for (line, text) in lines {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let [row, col, value] = tokens.as_slice() else {
            return Err(parse_err(line, format!("expected \"row col value\", got \"{text}\"")));
        };
        let row: usize = row
            .parse()
            .map_err(|_| parse_err(line, format!("invalid row index \"{row}\"")))?;
        let col: usize = col
            .parse()
            .map_err(|_| parse_err(line, format!("invalid column index \"{col}\"")))?;
        if row == 0 || col == 0 {
            return Err(parse_err(line, "cell indices are 1-based".to_string()));
        }
        let value = parse_value(value).ok_or_else(|| parse_err(line, format!("invalid value \"{value}\"")))?;
        cells.push((line, row - 1, col - 1, value));
    }

    let (rows, cols) = dims.unwrap_or_else(|| {
        cells.iter().fold((0, 0), |(rows, cols), (_, r, c, _)| {
            (rows.max(r + 1), cols.max(c + 1))
        })
    });
    if rows.checked_mul(cols).is_none_or(|cells| cells > MAX_CELLS) {
        return Err(DmlIoError::TooLarge {
            path: path.to_path_buf(),
            rows,
            cols,
        });
    }
    let mut matrix = Matrix::zeros((rows, cols));
    for (line, row, col, value) in cells {
        let cell = matrix.get_mut((row, col)).ok_or_else(|| {
            parse_err(
                line,
                format!("cell ({}, {}) outside a {rows}x{cols} matrix", row + 1, col + 1),
            )
        })?;
        *cell = value;
    }
    Ok(matrix)
}

pub fn parse_csv(path: &Path, contents: &str, header: bool, sep: &str) -> Result<Matrix, DmlIoError> {
    let mut values = Vec::new();
    let mut cols = None;
    let mut rows = 0;
    let data_lines = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .skip(usize::from(header));
    for (i, line) in data_lines {
        let row: Vec<&str> = line.split(sep).map(str::trim).collect();
        match cols {
            None => cols = Some(row.len()),
            Some(expected) if expected != row.len() => {
                return Err(DmlIoError::Parse {
                    path: path.to_path_buf(),
                    line: i + 1,
                    message: format!("expected {expected} columns, found {}", row.len()),
                });
            }
            _ => {}
        }
        for cell in row {
            // SystemDS leaves zero cells empty in sparse csv output
            let value = if cell.is_empty() {
                0.0
            } else {
                parse_value(cell).ok_or_else(|| DmlIoError::Parse {
                    path: path.to_path_buf(),
                    line: i + 1,
                    message: format!("invalid value \"{cell}\""),
                })?
            };
            values.push(value);
        }
        rows += 1;
    }
    Ok(Matrix::from_shape_vec((rows, cols.unwrap_or(0)), values)?)
}

/// Writes `matrix` plus its `.mtd`, so DML `read()` can load it without format arguments.
pub fn write_matrix(path: &Path, matrix: &Matrix, format: MatrixFormat) -> Result<(), DmlIoError> {
    let mut contents = String::new();
    match format {
        MatrixFormat::Text => {
            for ((row, col), value) in matrix.indexed_iter() {
                if *value != 0.0 {
                    contents.push_str(&format!("{} {} {}\n", row + 1, col + 1, format_value(*value)));
                }
            }
        }
        MatrixFormat::Csv => {
            for row in matrix.rows() {
                let cells: Vec<String> = row.iter().map(|x| format_value(*x)).collect();
                contents.push_str(&cells.join(","));
                contents.push('\n');
            }
        }
    }
    let write = |target: &Path, data: &str| {
        fs::write(target, data).map_err(|source| DmlIoError::Io {
            path: target.to_path_buf(),
            source,
        })
    };
    write(path, &contents)?;

    let metadata = MatrixMetadata::for_matrix(matrix, format);
    let mtd_path = metadata_path(path);
    let json = serde_json::to_string_pretty(&metadata).map_err(|source| DmlIoError::Metadata {
        path: mtd_path.clone(),
        source,
    })?;
    write(&mtd_path, &json)
}
