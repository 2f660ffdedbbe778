use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
///
/// * `input_file` - file name--either gzipped or not
///
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    match ext {
        Some("gz") => {
            let input_file = File::open(input_file)?;
            let decoder = GzDecoder::new(input_file);
            Ok(Box::new(BufReader::new(decoder)))
        }
        _ => {
            let input_file = File::open(input_file)?;
            Ok(Box::new(BufReader::new(input_file)))
        }
    }
}

///
/// Open a file for writing, and return a buffered writer
///
/// * `output_file` - file name--either gzipped or not
///
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    match ext {
        Some("gz") => {
            let output_file = File::create(output_file)?;
            let encoder =
                flate2::write::GzEncoder::new(output_file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => {
            let output_file = File::create(output_file)?;
            Ok(Box::new(BufWriter::new(output_file)))
        }
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

///
/// Read a tab-separated matrix of parseable values, one row per line
///
/// * `input_file` - file name--either gzipped or not
///
pub fn read_lines_of_types<T>(input_file: &str) -> anyhow::Result<Vec<Vec<T>>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let buf = open_buf_reader(input_file)?;
    let mut rows = vec![];
    for line in buf.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|w| {
                w.parse::<T>()
                    .map_err(|e| anyhow::anyhow!("failed to parse '{}': {}", w, e))
            })
            .collect::<anyhow::Result<Vec<T>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

///
/// Read a tab-separated table with one header line of column names
///
pub fn read_lines_with_header(input_file: &str) -> anyhow::Result<(Vec<String>, Vec<Vec<u32>>)> {
    let buf = open_buf_reader(input_file)?;
    let mut lines = buf.lines();

    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty file: {}", input_file))??;
    let names: Vec<String> = header.split_whitespace().map(|w| w.to_string()).collect();

    let mut rows = vec![];
    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|w| {
                w.parse::<u32>()
                    .map_err(|e| anyhow::anyhow!("failed to parse '{}': {}", w, e))
            })
            .collect::<anyhow::Result<Vec<u32>>>()?;
        anyhow::ensure!(
            row.len() == names.len(),
            "row with {} fields under a {}-column header",
            row.len(),
            names.len()
        );
        rows.push(row);
    }
    Ok((names, rows))
}

///
/// Create a directory if needed
///
/// * `file` - file name
///
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzipped_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir
            .path()
            .join("matrix.tsv.gz")
            .to_str()
            .expect("temp path")
            .to_string();

        let lines = vec!["1\t2\t3".to_string(), "4\t5\t6".to_string()];
        write_lines(&lines, &path)?;

        let rows: Vec<Vec<f32>> = read_lines_of_types(&path)?;
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        Ok(())
    }

    #[test]
    fn header_table_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir
            .path()
            .join("covar.tsv")
            .to_str()
            .expect("temp path")
            .to_string();

        write_lines(&["batch\tdonor", "0\t1", "1\t0"], &path)?;

        let (names, rows) = read_lines_with_header(&path)?;
        assert_eq!(names, vec!["batch".to_string(), "donor".to_string()]);
        assert_eq!(rows, vec![vec![0, 1], vec![1, 0]]);
        Ok(())
    }
}
