use core::time::Duration;

use mesh_primitives::Value;
use mesh_radix::Filter;
use tempdir::TempDir;

use super::{Cell, Radisk, RadiskOptions, FIRST_FILE};

fn small_file_opts(dir: &TempDir) -> RadiskOptions {
    let mut opts = RadiskOptions::new(
        camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir"),
    );
    // The classic test configuration: a 100 byte file cap so slicing is
    // exercised with a handful of keys.
    opts.size = 100;
    opts.batch = 1024 * 1024;
    opts.write = Duration::from_millis(1);
    opts
}

async fn open(dir: &TempDir) -> Radisk {
    Radisk::open(small_file_opts(dir))
        .await
        .expect("open should succeed")
}

fn disk_files(dir: &TempDir) -> Vec<(String, u64)> {
    let mut files: Vec<(String, u64)> = std::fs::read_dir(dir.path())
        .expect("read_dir should succeed")
        .map(|entry| {
            let entry = entry.expect("dir entry should be readable");
            (
                entry.file_name().to_string_lossy().into_owned(),
                entry.metadata().expect("metadata should succeed").len(),
            )
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn write_flush_read_roundtrip() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;

    {
        let mut radisk = open(&dir).await;
        radisk
            .write(b"mark\x05name", Cell::stated(Value::from("Mark"), 1.0))
            .await?;
        radisk.flush().await?;
    }

    // A fresh instance must see the data from disk alone.
    let mut radisk = open(&dir).await;
    assert_eq!(
        radisk.read(b"mark\x05name").await?,
        Some(Cell::stated(Value::from("Mark"), 1.0))
    );
    assert_eq!(radisk.read(b"mark\x05nope").await?, None);
    Ok(())
}

#[tokio::test]
async fn unflushed_writes_are_visible_to_reads() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    radisk
        .write(b"key", Cell::stated(Value::from("staged"), 1.0))
        .await?;

    // Nothing on disk yet, but the read sees the batch overlay.
    assert!(disk_files(&dir).is_empty());
    assert_eq!(
        radisk.read(b"key").await?,
        Some(Cell::stated(Value::from("staged"), 1.0))
    );
    Ok(())
}

#[tokio::test]
async fn first_file_is_named_bang() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    radisk
        .write(b"a", Cell::stated(Value::from("v"), 1.0))
        .await?;
    radisk.flush().await?;

    let files = disk_files(&dir);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, FIRST_FILE);
    Ok(())
}

#[tokio::test]
async fn oversize_trees_are_sliced_under_the_cap() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    for i in 0..20_u32 {
        let key = format!("soul{i:02}\x05field");
        radisk
            .write(key.as_bytes(), Cell::stated(Value::Number(f64::from(i)), 1.0))
            .await?;
    }
    radisk.flush().await?;

    let files = disk_files(&dir);
    assert!(files.len() > 1, "100-byte cap must force slicing");
    assert_eq!(files.iter().filter(|(name, _)| name == "!").count(), 1);
    for (name, len) in &files {
        assert!(
            *len <= 100,
            "file {name} is {len} bytes, over the configured cap"
        );
    }

    // Every key must still be readable, from whichever slice holds it.
    for i in 0..20_u32 {
        let key = format!("soul{i:02}\x05field");
        assert_eq!(
            radisk.read(key.as_bytes()).await?,
            Some(Cell::stated(Value::Number(f64::from(i)), 1.0)),
            "key {key:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn slices_survive_reopen() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;

    {
        let mut radisk = open(&dir).await;
        for i in 0..20_u32 {
            let key = format!("soul{i:02}\x05field");
            radisk
                .write(key.as_bytes(), Cell::stated(Value::Number(f64::from(i)), 1.0))
                .await?;
        }
        radisk.flush().await?;
    }

    let mut radisk = open(&dir).await;
    for i in 0..20_u32 {
        let key = format!("soul{i:02}\x05field");
        assert!(radisk.read(key.as_bytes()).await?.is_some(), "key {key:?}");
    }
    Ok(())
}

#[tokio::test]
async fn range_enumerates_ascending_across_slices() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    let mut expected = Vec::new();
    for i in (0..20_u32).rev() {
        let key = format!("k{i:02}");
        radisk
            .write(key.as_bytes(), Cell::stated(Value::Number(f64::from(i)), 1.0))
            .await?;
        expected.push(key.into_bytes());
    }
    expected.sort();
    radisk.flush().await?;

    let all = radisk
        .range(&Filter::Range { lo: None, hi: None })
        .await?;
    let keys: Vec<Vec<u8>> = all.iter().map(|(key, _)| key.clone()).collect();
    assert_eq!(keys, expected);

    let window = radisk
        .range(&Filter::Range {
            lo: Some(b"k05"),
            hi: Some(b"k10"),
        })
        .await?;
    assert_eq!(window.len(), 6);
    assert_eq!(window[0].0, b"k05".to_vec());
    assert_eq!(window[5].0, b"k10".to_vec());
    Ok(())
}

#[tokio::test]
async fn prefix_range_spans_batch_and_disk() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    radisk
        .write(b"mark\x05age", Cell::stated(Value::Number(23.0), 1.0))
        .await?;
    radisk.flush().await?;
    radisk
        .write(b"mark\x05name", Cell::stated(Value::from("Mark"), 2.0))
        .await?;

    let hits = radisk.range(&Filter::Prefix(b"mark\x05")).await?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, b"mark\x05age".to_vec());
    assert_eq!(hits[1].0, b"mark\x05name".to_vec());
    Ok(())
}

#[tokio::test]
async fn newer_write_wins_within_and_across_flushes() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    radisk
        .write(b"k", Cell::stated(Value::from("old"), 1.0))
        .await?;
    radisk.flush().await?;
    radisk
        .write(b"k", Cell::stated(Value::from("new"), 2.0))
        .await?;
    radisk.flush().await?;

    assert_eq!(
        radisk.read(b"k").await?,
        Some(Cell::stated(Value::from("new"), 2.0))
    );
    Ok(())
}

#[tokio::test]
async fn null_tombstone_round_trips() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    radisk
        .write(b"gone", Cell::stated(Value::Null, 5.0))
        .await?;
    radisk.flush().await?;

    let mut reopened = open(&dir).await;
    assert_eq!(
        reopened.read(b"gone").await?,
        Some(Cell::stated(Value::Null, 5.0))
    );
    Ok(())
}

#[tokio::test]
async fn batch_threshold_forces_early_flush() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut opts = small_file_opts(&dir);
    opts.batch = 32;
    let mut radisk = Radisk::open(opts).await?;

    radisk
        .write(
            b"long-enough-key",
            Cell::stated(Value::from("long enough value to cross"), 1.0),
        )
        .await?;

    assert!(
        !disk_files(&dir).is_empty(),
        "crossing the batch threshold must flush inline"
    );
    assert!(radisk.flush_deadline().is_none());
    Ok(())
}

#[tokio::test]
async fn flush_deadline_tracks_dirtiness() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    assert!(radisk.flush_deadline().is_none());
    radisk
        .write(b"k", Cell::stated(Value::from("v"), 1.0))
        .await?;
    assert!(radisk.flush_deadline().is_some());
    radisk.flush().await?;
    assert!(radisk.flush_deadline().is_none());
    Ok(())
}

#[tokio::test]
async fn corrupt_file_reports_error_on_read() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;

    {
        let mut radisk = open(&dir).await;
        radisk
            .write(b"k", Cell::stated(Value::from("v"), 1.0))
            .await?;
        radisk.flush().await?;
    }

    std::fs::write(dir.path().join(FIRST_FILE), b"not a radisk image")?;

    let mut radisk = open(&dir).await;
    assert!(radisk.read(b"k").await.is_err());
    Ok(())
}

#[tokio::test]
async fn stats_count_flushes_and_slices() -> eyre::Result<()> {
    let dir = TempDir::new("radisk")?;
    let mut radisk = open(&dir).await;

    for i in 0..20_u32 {
        radisk
            .write(
                format!("key{i:02}").as_bytes(),
                Cell::stated(Value::Number(f64::from(i)), 1.0),
            )
            .await?;
    }
    radisk.flush().await?;

    let stats = radisk.stats();
    assert_eq!(stats.flushes, 1);
    assert!(stats.files_written > 1);
    assert!(stats.slices > 0);
    Ok(())
}
