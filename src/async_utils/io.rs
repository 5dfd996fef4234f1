//! I/O utilities.
//!
//! Commands read small inputs (catalogs, item lists, OCR text) whole, and
//! write either one pretty-printed JSON document or a JSONL stream. Output
//! goes to a file if one was given, or to standard output.

use futures::{pin_mut, stream::StreamExt as _};
use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

use super::BoxedStream;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Read a whole file, or standard input if there's no path.
pub async fn read_to_string(path: Option<&Path>) -> Result<String> {
    let mut data = String::new();
    match path {
        Some(path) => {
            File::open(path)
                .await
                .with_context(|| format!("Failed to open file at path: {:?}", path))?
                .read_to_string(&mut data)
                .await
                .with_context(|| format!("Failed to read file at path: {:?}", path))?;
        }
        None => {
            tokio::io::stdin()
                .read_to_string(&mut data)
                .await
                .context("Failed to read standard input")?;
        }
    }
    Ok(data)
}

/// Write a single value as pretty-printed JSON.
pub async fn write_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let mut wtr = create_writer(path).await?;
    let mut json =
        serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    json.push('\n');
    wtr.write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    wtr.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write a stream of values to either standard output or a file, one JSON
/// object per line.
pub async fn write_jsonl<T>(path: Option<&Path>, stream: BoxedStream<Result<T>>) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let value = value?;
        let json = serde_json::to_string(&value).context("Failed to serialize JSON")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn test_write_jsonl_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let values: Vec<Result<Value>> = vec![
            Ok(serde_json::json!({"n": 1})),
            Ok(serde_json::json!({"n": 2})),
        ];
        write_jsonl(Some(&path), Box::pin(stream::iter(values)))
            .await
            .unwrap();
        let text = read_to_string(Some(&path)).await.unwrap();
        assert_eq!(text, "{\"n\":1}\n{\"n\":2}\n");
    }

    #[tokio::test]
    async fn test_write_json_is_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_json(Some(&path), &serde_json::json!({"a": [1]}))
            .await
            .unwrap();
        let text = read_to_string(Some(&path)).await.unwrap();
        assert!(text.contains("\n  \"a\""));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = read_to_string(Some(Path::new("/nonexistent/input.txt")))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("nonexistent"));
    }
}
