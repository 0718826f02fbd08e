use std::path::{Path, PathBuf};

use csv::StringRecord;
use parquet::{
    file::reader::{FileReader, SerializedFileReader},
    record::Field,
};

use crate::pipelines::text_classification;

/// Download-or-cache of the training data from the Hugging Face Hub
pub mod hub;

/// The text column every table must carry
pub static TEXT_COLUMN: &str = "text";

/// The label column of training tables, overwritten with predictions on output
pub static TARGET_COLUMN: &str = "target";

/// A labeled row of a training table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// The text for classification
    pub text: String,

    /// The class index of the text
    pub label: usize,
}

impl text_classification::Item for Item {
    fn input(&self) -> &str {
        &self.text
    }

    fn class_id(&self) -> usize {
        self.label
    }
}

/// A CSV file held in memory with its header, so every original column can be written back
#[derive(Clone, Debug)]
pub struct Table {
    /// Column names
    pub headers: StringRecord,

    /// Rows in file order
    pub rows: Vec<StringRecord>,
}

impl Table {
    /// Read a CSV file
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new()
            .from_path(path)
            .map_err(|e| DatasetError::from_csv(path, e))?;

        Self::from_reader(reader).map_err(|e| match e {
            DatasetError::Csv { source, .. } => DatasetError::Csv {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Read parquet shards, such as those of a Hub dataset split, into one
    /// table. Every shard must have the same columns.
    pub fn from_parquet(paths: &[PathBuf]) -> Result<Self, DatasetError> {
        let mut headers: Option<StringRecord> = None;
        let mut rows = Vec::new();

        for path in paths {
            let reader = SerializedFileReader::new(std::fs::File::open(path)?)
                .map_err(|e| DatasetError::from_parquet(path, e))?;

            let columns: StringRecord = reader
                .metadata()
                .file_metadata()
                .schema()
                .get_fields()
                .iter()
                .map(|field| field.name())
                .collect();

            match &headers {
                Some(expected) if *expected != columns => {
                    return Err(DatasetError::DataFormat(format!(
                        "{} has columns {:?}, expected {:?}",
                        path.display(),
                        columns,
                        expected
                    )))
                }
                Some(_) => {}
                None => headers = Some(columns),
            }

            let records = reader
                .get_row_iter(None)
                .map_err(|e| DatasetError::from_parquet(path, e))?;

            for row in records {
                let row = row.map_err(|e| DatasetError::from_parquet(path, e))?;

                rows.push(
                    row.get_column_iter()
                        .map(|(_, field)| field_to_string(field))
                        .collect(),
                );
            }
        }

        let headers =
            headers.ok_or_else(|| DatasetError::Empty("no parquet files to read".to_string()))?;

        Ok(Self { headers, rows })
    }

    /// Read CSV data from any reader
    pub fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, DatasetError> {
        let headers = reader
            .headers()
            .map_err(|e| DatasetError::from_csv(Path::new(""), e))?
            .clone();

        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatasetError::from_csv(Path::new(""), e))?;

        Ok(Self { headers, rows })
    }

    /// Number of data rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no data rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, or a format error naming it
    pub fn column(&self, name: &str) -> Result<usize, DatasetError> {
        self.headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| DatasetError::DataFormat(format!("missing required column '{name}'")))
    }

    /// The `text` value of every row, in order
    pub fn texts(&self) -> Result<Vec<String>, DatasetError> {
        let text = self.column(TEXT_COLUMN)?;

        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.get(text).map(str::to_string).ok_or_else(|| {
                    DatasetError::DataFormat(format!("row {} has no '{TEXT_COLUMN}' value", i + 1))
                })
            })
            .collect()
    }

    /// Labeled items from the `text` and `target` columns. Labels must be
    /// integers in `[0, num_classes)`.
    pub fn items(&self, num_classes: usize) -> Result<Vec<Item>, DatasetError> {
        let target = self.column(TARGET_COLUMN)?;
        let texts = self.texts()?;

        texts
            .into_iter()
            .zip(&self.rows)
            .enumerate()
            .map(|(i, (text, row))| {
                let raw = row.get(target).unwrap_or("").trim();

                let label = raw.parse::<usize>().map_err(|_| {
                    DatasetError::DataFormat(format!(
                        "row {}: '{raw}' is not a class index",
                        i + 1
                    ))
                })?;

                if label >= num_classes {
                    return Err(DatasetError::DataFormat(format!(
                        "row {}: label {label} is outside [0, {num_classes})",
                        i + 1
                    )));
                }

                Ok(Item { text, label })
            })
            .collect()
    }

    /// A copy of the table whose `target` column holds the given labels. The
    /// column is appended when the table has none.
    pub fn with_targets(&self, labels: &[usize]) -> Result<Self, DatasetError> {
        if labels.len() != self.rows.len() {
            return Err(DatasetError::DataFormat(format!(
                "{} predictions for {} rows",
                labels.len(),
                self.rows.len()
            )));
        }

        let existing = self.column(TARGET_COLUMN).ok();

        let mut headers = self.headers.clone();
        if existing.is_none() {
            headers.push_field(TARGET_COLUMN);
        }

        let rows = self
            .rows
            .iter()
            .zip(labels)
            .map(|(row, label)| {
                let label = label.to_string();
                match existing {
                    Some(target) => row
                        .iter()
                        .enumerate()
                        .map(|(i, field)| if i == target { label.as_str() } else { field })
                        .collect(),
                    None => {
                        let mut row = row.clone();
                        row.push_field(&label);
                        row
                    }
                }
            })
            .collect();

        Ok(Self { headers, rows })
    }

    /// Write the table as CSV, creating parent directories as needed
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = csv::Writer::from_path(path).map_err(|e| DatasetError::from_csv(path, e))?;

        writer
            .write_record(&self.headers)
            .map_err(|e| DatasetError::from_csv(path, e))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|e| DatasetError::from_csv(path, e))?;
        }
        writer.flush()?;

        Ok(())
    }
}

/// Dataset Error
#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    /// Required columns are missing or values are malformed
    #[error("data format error: {0}")]
    DataFormat(String),

    /// A split produced no rows
    #[error("empty dataset: {0}")]
    Empty(String),

    /// The CSV could not be parsed or written
    #[error("csv error in {path}: {source}")]
    Csv {
        /// The file being processed
        path: PathBuf,
        /// The underlying error
        source: csv::Error,
    },

    /// A parquet file could not be read
    #[error("parquet error in {path}: {source}")]
    Parquet {
        /// The file being processed
        path: PathBuf,
        /// The underlying error
        source: parquet::errors::ParquetError,
    },

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    fn from_csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }

    fn from_parquet(path: &Path, source: parquet::errors::ParquetError) -> Self {
        Self::Parquet {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Render a parquet value the way it reads in a CSV cell
fn field_to_string(field: &Field) -> String {
    match field {
        Field::Null => String::new(),
        Field::Str(value) => value.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn table(csv: &str) -> Table {
        Table::from_reader(csv::Reader::from_reader(csv.as_bytes())).unwrap()
    }

    #[test]
    fn reads_labeled_items() {
        let table = table("ID,text,target\na,좋다,0\nb,싫다,1\n");

        let items = table.items(7).unwrap();

        assert_eq!(
            items,
            vec![
                Item {
                    text: "좋다".to_string(),
                    label: 0
                },
                Item {
                    text: "싫다".to_string(),
                    label: 1
                },
            ]
        );
    }

    #[test]
    fn missing_columns_are_format_errors() {
        let no_target = table("ID,text\na,좋다\n");
        let no_text = table("ID,body,target\na,좋다,0\n");

        assert!(matches!(no_target.items(7), Err(DatasetError::DataFormat(_))));
        assert!(matches!(no_text.texts(), Err(DatasetError::DataFormat(_))));
    }

    #[test]
    fn rejects_labels_out_of_range() {
        let table = table("text,target\n좋다,9\n");

        let err = table.items(7).unwrap_err();

        assert!(err.to_string().contains("outside"), "{err}");
    }

    #[test]
    fn overwrites_existing_target_column() {
        let table = table("ID,text,target\na,x,5\nb,y,6\n");

        let out = table.with_targets(&[1, 2]).unwrap();

        assert_eq!(out.headers, StringRecord::from(vec!["ID", "text", "target"]));
        assert_eq!(out.rows[0], StringRecord::from(vec!["a", "x", "1"]));
        assert_eq!(out.rows[1], StringRecord::from(vec!["b", "y", "2"]));
    }

    #[test]
    fn appends_missing_target_column() {
        let table = table("ID,text\na,x\n");

        let out = table.with_targets(&[3]).unwrap();

        assert_eq!(out.headers, StringRecord::from(vec!["ID", "text", "target"]));
        assert_eq!(out.rows[0], StringRecord::from(vec!["a", "x", "3"]));
    }

    fn write_parquet(path: &Path, texts: &[&str], targets: &[i64]) {
        use std::sync::Arc;

        use parquet::{
            data_type::{ByteArray, ByteArrayType, Int64Type},
            file::{properties::WriterProperties, writer::SerializedFileWriter},
            schema::parser::parse_message_type,
        };

        let schema = Arc::new(
            parse_message_type(
                "message schema { REQUIRED BYTE_ARRAY text (UTF8); REQUIRED INT64 target; }",
            )
            .unwrap(),
        );
        let file = std::fs::File::create(path).unwrap();
        let mut writer =
            SerializedFileWriter::new(file, schema, Arc::new(WriterProperties::builder().build()))
                .unwrap();

        let mut row_group = writer.next_row_group().unwrap();

        let mut column = row_group.next_column().unwrap().unwrap();
        let values: Vec<ByteArray> = texts.iter().map(|text| ByteArray::from(*text)).collect();
        column
            .typed::<ByteArrayType>()
            .write_batch(&values, None, None)
            .unwrap();
        column.close().unwrap();

        let mut column = row_group.next_column().unwrap().unwrap();
        column
            .typed::<Int64Type>()
            .write_batch(targets, None, None)
            .unwrap();
        column.close().unwrap();

        row_group.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn reads_parquet_shards_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("train-00000-of-00002.parquet");
        let second = dir.path().join("train-00001-of-00002.parquet");
        write_parquet(&first, &["좋다", "싫다"], &[0, 1]);
        write_parquet(&second, &["정말 좋다"], &[6]);

        let table = Table::from_parquet(&[first, second]).unwrap();

        assert_eq!(table.headers, StringRecord::from(vec!["text", "target"]));
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[2], StringRecord::from(vec!["정말 좋다", "6"]));
        assert_eq!(table.items(7).unwrap()[1].label, 1);
    }
}
