//! Fetch -> transform -> write, across two pooled backends.
//!
//! An in-memory document store stands in for the source database and an
//! in-memory table for the destination. Pages are fetched in parallel,
//! flattened into rows, and written through a serializing runner so that
//! inserts never interleave.
//!
//! Run with `RUST_LOG=debug cargo run --example pipeline`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use ferry_concurrency::pool::ResourcePool;
use ferry_concurrency::scheduler::{ChainFactory, SerializingRunner, Task};
use ferry_core::error::{ResourceError, Result};
use ferry_core::traits::resource::{Capabilities, Resource};
use ferry_core::utils::FerryConfig;
use log::info;
use parking_lot::Mutex;

const CONFIG: &str = r#"
    [execution]
    default_parallelism = 4

    [pools.documents]
    capacity = 3
    claim_timeout_ms = 2000
    stats_interval_ms = 500

    [pools.warehouse]
    capacity = 1
    init_policy = "fail_fast"
"#;

type Document = BTreeMap<String, String>;

/// Read-only session on the document store.
struct DocumentSession {
    documents: Arc<Vec<Document>>,
    connected: bool,
}

impl Resource for DocumentSession {
    type Request = (usize, usize);
    type Response = Vec<Document>;

    fn open(&mut self) -> Result<()> {
        thread::sleep(Duration::from_millis(20));
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FETCH
    }

    fn fetch(&mut self, (offset, limit): (usize, usize)) -> Result<Vec<Document>> {
        if !self.connected {
            return Err(ResourceError::backend(
                "session is not connected",
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            )
            .into());
        }
        thread::sleep(Duration::from_millis(15));
        Ok(self
            .documents
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Write session on the destination table.
struct TableSession {
    rows: Arc<Mutex<Vec<(String, u32)>>>,
}

impl Resource for TableSession {
    type Request = Vec<(String, u32)>;
    type Response = usize;

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INSERT
    }

    fn insert(&mut self, rows: Vec<(String, u32)>) -> Result<usize> {
        let count = rows.len();
        self.rows.lock().extend(rows);
        Ok(count)
    }
}

fn sample_documents() -> Vec<Document> {
    (0..20)
        .map(|index| {
            let mut document = Document::new();
            document.insert("name".to_string(), format!("bike-{:02}", index));
            document.insert("price".to_string(), (100 + index * 7).to_string());
            document
        })
        .collect()
}

fn to_row(document: &Document) -> Option<(String, u32)> {
    let name = document.get("name")?.clone();
    let price = document.get("price")?.parse().ok()?;
    Some((name, price))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = FerryConfig::from_toml_str(CONFIG).context("invalid pipeline configuration")?;

    let documents = Arc::new(sample_documents());
    let source = {
        let documents = Arc::clone(&documents);
        Arc::new(ResourcePool::new(config.pool("documents")?, move || {
            Ok(DocumentSession {
                documents: Arc::clone(&documents),
                connected: false,
            })
        })?)
    };

    let table = Arc::new(Mutex::new(Vec::new()));
    let destination = {
        let table = Arc::clone(&table);
        Arc::new(ResourcePool::new(config.pool("warehouse")?, move || {
            Ok(TableSession {
                rows: Arc::clone(&table),
            })
        })?)
    };

    let chain = ChainFactory::new(config.execution.clone())?;
    let writer = Arc::new(SerializingRunner::new("warehouse-writer", true)?);

    let page_size = 6;
    let fetch = chain.parallel_default()?;
    for offset in (0..documents.len()).step_by(page_size) {
        let source = Arc::clone(&source);
        fetch.run(move || source.claim_default()?.fetch((offset, page_size)))?;
    }

    let write = fetch.then(move |pages| {
        let rows: Vec<_> = pages.iter().flatten().filter_map(to_row).collect();
        info!("Transformed {} documents into rows", rows.len());

        let written = rows
            .chunks(5)
            .map(|batch| {
                let destination = Arc::clone(&destination);
                let batch = batch.to_vec();
                writer.run(Task::labeled("insert-batch", move || {
                    destination.claim_default()?.insert(batch)
                }))
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(written.into_iter().sum::<usize>())
    });

    let written = write.get()?;
    info!("Pipeline finished: {:?} rows written", written);

    println!("rows written: {}", table.lock().len());
    for (name, price) in table.lock().iter().take(3) {
        println!("  {} -> {}", name, price);
    }

    source.close()?;
    Ok(())
}
