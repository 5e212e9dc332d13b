use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use itertools::Itertools;
use prost::Message;

use crate::burndown::BurndownResult;
use crate::couples::CouplesResult;
use crate::pb;

pub const FORMAT_VERSION: i32 = 1;

/// Header fields shared by the text and binary outputs.
pub struct OutputHeader {
    pub hash: String,
    pub repository: String,
    pub begin_unix_time: i64,
    pub end_unix_time: i64,
    pub commits: usize,
    pub tick_size_hours: u32,
}

/// Decimal rows, right-aligned to the widest value. The text path is the
/// only place where negative residuals are clamped to zero.
fn write_matrix(
    out: &mut impl Write,
    indent: &str,
    matrix: &[Vec<i64>],
) -> Result<()> {
    let width = matrix
        .iter()
        .flatten()
        .map(|&v| format!("{}", v.max(0)).len())
        .max()
        .unwrap_or(1);
    for row in matrix {
        let cells = row.iter().map(|&v| format!("{:>width$}", v.max(0), width = width)).join(" ");
        writeln!(out, "{}{}", indent, cells)?;
    }
    Ok(())
}

fn write_sparse_row(out: &mut impl Write, row: &HashMap<usize, i64>) -> Result<()> {
    let mut cells: Vec<(usize, i64)> = row.iter().map(|(&c, &v)| (c, v)).collect();
    cells.sort_by_key(|&(c, _)| c);
    write!(out, "{{")?;
    for (i, (column, value)) in cells.iter().enumerate() {
        if i > 0 {
            write!(out, ", ")?;
        }
        write!(out, "{}: {}", column, value)?;
    }
    writeln!(out, "}}")?;
    Ok(())
}

pub fn render_text(
    out: &mut impl Write,
    header: &OutputHeader,
    burndown: &BurndownResult,
    couples: Option<&CouplesResult>,
) -> Result<()> {
    writeln!(out, "version: {}", FORMAT_VERSION)?;
    writeln!(out, "begin_unix_time: {}", header.begin_unix_time)?;
    writeln!(out, "end_unix_time: {}", header.end_unix_time)?;
    writeln!(out, "commits: {}", header.commits)?;
    writeln!(out, "granularity: {}", burndown.granularity)?;
    writeln!(out, "sampling: {}", burndown.sampling)?;
    writeln!(out, "tick_size: {}", header.tick_size_hours)?;
    writeln!(out, "project: |-")?;
    write_matrix(out, "  ", &burndown.project)?;

    if !burndown.files.is_empty() {
        writeln!(out, "files:")?;
        for (path, matrix) in &burndown.files {
            writeln!(out, "  {:?}: |-", path)?;
            write_matrix(out, "    ", matrix)?;
        }
    }

    if !burndown.people.is_empty() {
        writeln!(out, "people_sequence:")?;
        for (name, _) in &burndown.people {
            writeln!(out, "  - {:?}", name)?;
        }
        writeln!(out, "people:")?;
        for (id, (_, matrix)) in burndown.people.iter().enumerate() {
            writeln!(out, "  {}: |-", id)?;
            write_matrix(out, "    ", matrix)?;
        }
        writeln!(out, "people_interaction: |-")?;
        write_matrix(out, "  ", &burndown.people_interaction)?;
    }

    if let Some(couples) = couples {
        writeln!(out, "files_coocc:")?;
        for (index, path) in couples.file_index.iter().enumerate() {
            write!(out, "  {:?}: ", path)?;
            write_sparse_row(out, &couples.file_matrix[index])?;
        }
        writeln!(out, "people_coocc:")?;
        for (index, name) in couples.people.iter().enumerate() {
            write!(out, "  {:?}: ", name)?;
            write_sparse_row(out, &couples.people_matrix[index])?;
        }
    }
    Ok(())
}

fn burndown_message(burndown: &BurndownResult) -> pb::BurndownAnalysisResults {
    pb::BurndownAnalysisResults {
        granularity: burndown.granularity as i32,
        sampling: burndown.sampling as i32,
        project: Some(pb::dense_to_csr(&burndown.project)),
        files: burndown
            .files
            .iter()
            .map(|(path, matrix)| pb::BurndownSparseMatrix {
                name: path.clone(),
                matrix: Some(pb::dense_to_csr(matrix)),
            })
            .collect(),
        people: burndown
            .people
            .iter()
            .map(|(name, matrix)| pb::BurndownSparseMatrix {
                name: name.clone(),
                matrix: Some(pb::dense_to_csr(matrix)),
            })
            .collect(),
        people_interaction: if burndown.people_interaction.is_empty() {
            None
        } else {
            Some(pb::dense_to_csr(&burndown.people_interaction))
        },
    }
}

fn couples_message(couples: &CouplesResult) -> pb::CouplesAnalysisResults {
    pb::CouplesAnalysisResults {
        file_index: couples.file_index.clone(),
        file_couples: Some(pb::sparse_to_csr(&couples.file_matrix, couples.file_index.len())),
        people_index: couples.people.clone(),
        people_files: Some(pb::sparse_to_csr(&couples.people_matrix, couples.file_index.len())),
        people_commits: couples.people_commits.clone(),
    }
}

/// Little-endian length-framed protobuf document.
pub fn render_binary(
    out: &mut impl Write,
    header: &OutputHeader,
    burndown: &BurndownResult,
    couples: Option<&CouplesResult>,
) -> Result<()> {
    let mut contents = HashMap::new();
    contents.insert("burndown".to_string(), burndown_message(burndown).encode_to_vec());
    if let Some(couples) = couples {
        contents.insert("couples".to_string(), couples_message(couples).encode_to_vec());
    }
    let results = pb::AnalysisResults {
        metadata: Some(pb::Metadata {
            version: FORMAT_VERSION,
            hash: header.hash.clone(),
            repository: header.repository.clone(),
            begin_unix_time: header.begin_unix_time,
            end_unix_time: header.end_unix_time,
            commits: header.commits as i32,
            tick_size: header.tick_size_hours as i64,
        }),
        contents,
    };
    let bytes = results.encode_to_vec();
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> (OutputHeader, BurndownResult) {
        let header = OutputHeader {
            hash: "deadbeef".to_string(),
            repository: "repo".to_string(),
            begin_unix_time: 100,
            end_unix_time: 200,
            commits: 2,
            tick_size_hours: 24,
        };
        let burndown = BurndownResult {
            granularity: 30,
            sampling: 30,
            project: vec![vec![100, 0], vec![95, 5]],
            files: BTreeMap::new(),
            people: Vec::new(),
            people_interaction: Vec::new(),
        };
        (header, burndown)
    }

    #[test]
    fn text_document_shape() {
        let (header, burndown) = sample();
        let mut out = Vec::new();
        render_text(&mut out, &header, &burndown, None).unwrap();
        let text = String::from_utf8(out).unwrap();
        let expected = "version: 1\n\
                        begin_unix_time: 100\n\
                        end_unix_time: 200\n\
                        commits: 2\n\
                        granularity: 30\n\
                        sampling: 30\n\
                        tick_size: 24\n\
                        project: |-\n  100   0\n   95   5\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn negative_residuals_clamp_only_in_text() {
        let (header, mut burndown) = sample();
        burndown.project[1][1] = -2;
        let mut out = Vec::new();
        render_text(&mut out, &header, &burndown, None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(" 0\n"), "{}", text);
        assert!(!text.contains("-2"), "{}", text);

        let mut bin = Vec::new();
        render_binary(&mut bin, &header, &burndown, None).unwrap();
        let decoded = pb::AnalysisResults::decode(&bin[4..]).unwrap();
        let inner = pb::BurndownAnalysisResults::decode(
            decoded.contents["burndown"].as_slice(),
        )
        .unwrap();
        assert!(inner.project.unwrap().data.contains(&-2));
    }

    #[test]
    fn frame_length_prefix_is_little_endian() {
        let (header, burndown) = sample();
        let mut bin = Vec::new();
        render_binary(&mut bin, &header, &burndown, None).unwrap();
        let len = u32::from_le_bytes([bin[0], bin[1], bin[2], bin[3]]) as usize;
        assert_eq!(len, bin.len() - 4);
    }
}
