//! Image pipeline: an upload notification starts one durable instance that
//! extracts image metadata and then stores it in a metadata database.
//!
//! Run with `cargo run --example image_pipeline [work-dir]`. The work directory
//! holds the history database, the metadata database and the `uploads/` folder.
//! Re-running against the same directory resumes unfinished instances,
//! deduplicates notifications and never stores a metadata row twice.

use duraflow::providers::sqlite::SqliteHistoryStore;
use duraflow::runtime::observability::{LogFormat, ObservabilityConfig};
use duraflow::{
    ActivityContext, ActivityRegistry, BackoffStrategy, OrchestrationContext, OrchestrationRegistry, RetryPolicy,
    Runtime, RuntimeOptions, TriggerAdapter, durable_info, durable_warn,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Serialize, Deserialize)]
struct ImageMetadata {
    file_name: String,
    file_size_kb: f64,
    width: u32,
    height: u32,
    format: String,
}

/// Format and dimensions from the image header. PNG and GIF only.
fn read_header(bytes: &[u8]) -> Result<(&'static str, u32, u32), String> {
    if bytes.starts_with(PNG_SIGNATURE) && bytes.len() >= 24 {
        let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        return Ok(("PNG", width, height));
    }
    if (bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")) && bytes.len() >= 10 {
        let width = u16::from_le_bytes([bytes[6], bytes[7]]);
        let height = u16::from_le_bytes([bytes[8], bytes[9]]);
        return Ok(("GIF", u32::from(width), u32::from(height)));
    }
    Err("unsupported image format".to_string())
}

async fn extract_metadata(work_dir: &Path, blob_name: &str) -> Result<ImageMetadata, String> {
    let bytes = tokio::fs::read(work_dir.join(blob_name))
        .await
        .map_err(|e| format!("cannot read {blob_name}: {e}"))?;
    let (format, width, height) = read_header(&bytes)?;
    let file_name = Path::new(blob_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| blob_name.to_string());
    Ok(ImageMetadata {
        file_name,
        file_size_kb: (bytes.len() as f64 / 1024.0 * 100.0).round() / 100.0,
        width,
        height,
        format: format.to_string(),
    })
}

async fn open_metadata_db(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_metadata (
            instance_id TEXT NOT NULL,
            event_id INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            file_size_kb REAL NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            format TEXT NOT NULL,
            PRIMARY KEY (instance_id, event_id)
        )
        "#,
    )
    .execute(&pool)
    .await?;
    Ok(pool)
}

/// Insert one metadata row. A re-delivered attempt hits the same key and is ignored.
async fn store_metadata(
    pool: &SqlitePool,
    instance_id: &str,
    event_id: u64,
    metadata: &ImageMetadata,
) -> Result<bool, String> {
    let event_id = i64::try_from(event_id).map_err(|e| e.to_string())?;
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO image_metadata \
         (instance_id, event_id, file_name, file_size_kb, width, height, format) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(instance_id)
    .bind(event_id)
    .bind(&metadata.file_name)
    .bind(metadata.file_size_kb)
    .bind(metadata.width)
    .bind(metadata.height)
    .bind(&metadata.format)
    .execute(pool)
    .await
    .map_err(|e| format!("metadata insert failed: {e}"))?;
    Ok(inserted.rows_affected() == 1)
}

/// A header-only PNG standing in for a real upload.
fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes.resize(3 * 1024, 0);
    bytes
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| "image_pipeline".to_string()));
    tokio::fs::create_dir_all(work_dir.join("uploads")).await?;
    tokio::fs::write(work_dir.join("uploads/cat.png"), sample_png(640, 480)).await?;

    let store = Arc::new(SqliteHistoryStore::open(work_dir.join("history.db")).await?);
    let metadata_db = open_metadata_db(&work_dir.join("metadata.db")).await?;

    let extract_dir = work_dir.clone();
    let store_pool = metadata_db.clone();
    let activities = ActivityRegistry::builder()
        .register_typed("ExtractMetadata", move |ctx: ActivityContext, blob_name: String| {
            let work_dir = extract_dir.clone();
            async move {
                ctx.trace_info(format!("reading {blob_name}"));
                extract_metadata(&work_dir, &blob_name).await
            }
        })
        .register_with_retry(
            "StoreMetadata",
            RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
                delay: Duration::from_millis(200),
            }),
            move |ctx: ActivityContext, input: String| {
                let pool = store_pool.clone();
                async move {
                    // the metadata database rejects the first connection attempt
                    if ctx.attempt() == 1 {
                        ctx.trace_warn("metadata database unavailable");
                        return Err("metadata database unavailable".to_string());
                    }
                    let metadata: ImageMetadata = serde_json::from_str(&input).map_err(|e| e.to_string())?;
                    if !store_metadata(&pool, ctx.instance_id(), ctx.event_id(), &metadata).await? {
                        ctx.trace_info("metadata row already stored");
                    }
                    Ok(input)
                }
            },
        )
        .build()?;

    let orchestrations = OrchestrationRegistry::builder()
        .register("ImagePipeline", |ctx: OrchestrationContext, blob_name: String| async move {
            let metadata: ImageMetadata = ctx.schedule_activity_typed("ExtractMetadata", &blob_name).await?;
            durable_info!(
                ctx,
                file = %metadata.file_name,
                width = metadata.width,
                height = metadata.height,
                "metadata extracted"
            );
            if metadata.width == 0 || metadata.height == 0 {
                durable_warn!(ctx, "empty image");
                return Err(format!("{blob_name} has no pixels"));
            }
            let _: ImageMetadata = ctx.schedule_activity_typed("StoreMetadata", &metadata).await?;
            let finished = ctx.utc_now().await?;
            durable_info!(ctx, ?finished, "metadata stored");
            Ok("Orchestration completed".to_string())
        })
        .build()?;

    let options = RuntimeOptions {
        observability: ObservabilityConfig {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        },
        ..Default::default()
    };
    let rt = Runtime::start_with_options(store, activities, orchestrations, options).await;
    let client = rt.client();
    let trigger = TriggerAdapter::new(client.clone(), "ImagePipeline");

    // the upload queue delivers at least once
    let first = trigger.notify_new_work("uploads/cat.png").await?;
    let again = trigger.notify_new_work("uploads/cat.png").await?;
    assert_eq!(first, again);

    let status = client.wait_for_orchestration(&first, Duration::from_secs(10)).await?;
    println!("{first}: {status:?}");
    for event in client.read_history(&first).await? {
        println!("  #{} {}", event.event_id, event.kind.type_name());
    }

    let rows: Vec<(String, f64, i64, i64, String)> =
        sqlx::query_as("SELECT file_name, file_size_kb, width, height, format FROM image_metadata WHERE instance_id = ?")
            .bind(&first)
            .fetch_all(&metadata_db)
            .await?;
    for (file_name, size_kb, width, height, format) in rows {
        println!("  stored {file_name}: {size_kb} KB {width}x{height} {format}");
    }

    rt.shutdown().await;
    metadata_db.close().await;
    Ok(())
}
