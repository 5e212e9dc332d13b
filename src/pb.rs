use std::collections::HashMap;

/// Header of the framed binary document.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    #[prost(int32, tag = "1")]
    pub version: i32,
    /// Hash of the commit the analysis ended on.
    #[prost(string, tag = "2")]
    pub hash: String,
    #[prost(string, tag = "3")]
    pub repository: String,
    #[prost(int64, tag = "4")]
    pub begin_unix_time: i64,
    #[prost(int64, tag = "5")]
    pub end_unix_time: i64,
    #[prost(int32, tag = "6")]
    pub commits: i32,
    /// Hours per tick.
    #[prost(int64, tag = "7")]
    pub tick_size: i64,
}

/// Top-level envelope: a metadata header plus one serialized result blob per
/// analyzer, keyed by analyzer name.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnalysisResults {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(map = "string, bytes", tag = "2")]
    pub contents: HashMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompressedSparseRowMatrix {
    #[prost(int32, tag = "1")]
    pub number_of_rows: i32,
    #[prost(int32, tag = "2")]
    pub number_of_columns: i32,
    #[prost(int64, repeated, tag = "3")]
    pub data: Vec<i64>,
    #[prost(int32, repeated, tag = "4")]
    pub indices: Vec<i32>,
    #[prost(int64, repeated, tag = "5")]
    pub indptr: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BurndownSparseMatrix {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub matrix: Option<CompressedSparseRowMatrix>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BurndownAnalysisResults {
    #[prost(int32, tag = "1")]
    pub granularity: i32,
    #[prost(int32, tag = "2")]
    pub sampling: i32,
    #[prost(message, optional, tag = "3")]
    pub project: Option<CompressedSparseRowMatrix>,
    #[prost(message, repeated, tag = "4")]
    pub files: Vec<BurndownSparseMatrix>,
    #[prost(message, repeated, tag = "5")]
    pub people: Vec<BurndownSparseMatrix>,
    #[prost(message, optional, tag = "6")]
    pub people_interaction: Option<CompressedSparseRowMatrix>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CouplesAnalysisResults {
    #[prost(string, repeated, tag = "1")]
    pub file_index: Vec<String>,
    #[prost(message, optional, tag = "2")]
    pub file_couples: Option<CompressedSparseRowMatrix>,
    #[prost(string, repeated, tag = "3")]
    pub people_index: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub people_files: Option<CompressedSparseRowMatrix>,
    #[prost(int64, repeated, tag = "5")]
    pub people_commits: Vec<i64>,
}

/// Nonzero cells of a dense matrix in CSR form.
pub fn dense_to_csr(matrix: &[Vec<i64>]) -> CompressedSparseRowMatrix {
    let columns = matrix.first().map(|row| row.len()).unwrap_or(0);
    let mut out = CompressedSparseRowMatrix {
        number_of_rows: matrix.len() as i32,
        number_of_columns: columns as i32,
        data: Vec::new(),
        indices: Vec::new(),
        indptr: vec![0],
    };
    for row in matrix {
        for (column, &value) in row.iter().enumerate() {
            if value != 0 {
                out.data.push(value);
                out.indices.push(column as i32);
            }
        }
        out.indptr.push(out.data.len() as i64);
    }
    out
}

/// CSR out of sparse rows, with a fixed column count.
pub fn sparse_to_csr(rows: &[HashMap<usize, i64>], columns: usize) -> CompressedSparseRowMatrix {
    let mut out = CompressedSparseRowMatrix {
        number_of_rows: rows.len() as i32,
        number_of_columns: columns as i32,
        data: Vec::new(),
        indices: Vec::new(),
        indptr: vec![0],
    };
    for row in rows {
        let mut cells: Vec<(usize, i64)> =
            row.iter().map(|(&column, &value)| (column, value)).collect();
        cells.sort_by_key(|&(column, _)| column);
        for (column, value) in cells {
            if value != 0 {
                out.data.push(value);
                out.indices.push(column as i32);
            }
        }
        out.indptr.push(out.data.len() as i64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn csr_of_a_dense_matrix() {
        let csr = dense_to_csr(&[vec![5, 0, 0], vec![0, 0, 7], vec![0, 0, 0]]);
        assert_eq!(csr.number_of_rows, 3);
        assert_eq!(csr.number_of_columns, 3);
        assert_eq!(csr.data, vec![5, 7]);
        assert_eq!(csr.indices, vec![0, 2]);
        assert_eq!(csr.indptr, vec![0, 1, 2, 2]);
    }

    #[test]
    fn messages_roundtrip() {
        let results = AnalysisResults {
            metadata: Some(Metadata {
                version: 1,
                hash: "abc".into(),
                repository: "repo".into(),
                begin_unix_time: 10,
                end_unix_time: 20,
                commits: 2,
                tick_size: 24,
            }),
            contents: HashMap::from([("burndown".to_string(), vec![1, 2, 3])]),
        };
        let bytes = results.encode_to_vec();
        let decoded = AnalysisResults::decode(bytes.as_slice()).unwrap();
        assert_eq!(results, decoded);
    }
}
