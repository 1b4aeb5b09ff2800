//! End-to-end path through the object-store client and the bulk loader:
//! fs-mirrored blob -> spooled gzip -> streaming CSV -> bronze table.

use chrono::{NaiveDate, Utc};
use common::db::{self, Database};
use common::object_store::{blob_key, FsObjectStore, ObjectStore};
use common::types::Exchange;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

const VENDOR: &str = "lseg";
const PRODUCT: &str = "tick-history";

fn write_blob(root: &std::path::Path, exchange: Exchange, date: NaiveDate, csv_text: &str) {
    let key = blob_key(VENDOR, PRODUCT, exchange, date);
    let path = root.join(&key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(&path).unwrap();
    let mut enc = GzEncoder::new(file, Compression::default());
    enc.write_all(csv_text.as_bytes()).unwrap();
    enc.finish().unwrap();
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_fetch_and_bulk_load_many_rows() {
    let dir = tempfile::tempdir().unwrap();

    // Enough rows that a buffering bug would be obvious, small enough to be
    // quick. The loader must only ever hold one record in memory.
    let mut csv_text = String::from("Ric,Price,Volume\n");
    for i in 0..5000 {
        csv_text.push_str(&format!("VOD.L,{}.5,{}\n", 100 + (i % 50), i));
    }
    let d = date("2025-01-15");
    write_blob(dir.path(), Exchange::Lse, d, &csv_text);

    let store = FsObjectStore::new(dir.path(), VENDOR, PRODUCT);
    let meta = store.head(Exchange::Lse, d).await.unwrap();
    let blob = store.fetch(Exchange::Lse, d).await.unwrap();
    let reader = blob.into_reader().unwrap();

    let mut db = Database::open(":memory:").unwrap();
    db.init_schema().unwrap();
    let inserted =
        db::bulk_load_csv(&mut db.conn, Exchange::Lse, d, &meta.path, reader, Utc::now()).unwrap();
    assert_eq!(inserted, 5000);
    assert_eq!(
        db::count_loaded_records(&db.conn, Exchange::Lse, d, &meta.path).unwrap(),
        5000
    );

    // Metadata columns are stamped on every row.
    let (data_date, exchange, source): (String, String, String) = db
        .conn
        .query_row(
            "SELECT data_date, exchange, source_file FROM lse_market_data_raw LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(data_date, "2025-01-15");
    assert_eq!(exchange, "LSE");
    assert_eq!(source, meta.path);
}

#[tokio::test]
async fn test_two_days_share_one_pinned_table() {
    let dir = tempfile::tempdir().unwrap();
    let d1 = date("2025-01-15");
    let d2 = date("2025-01-16");
    write_blob(dir.path(), Exchange::Cme, d1, "Ric,Price\nESH5,4800.25\n");
    write_blob(
        dir.path(),
        Exchange::Cme,
        d2,
        "Ric,Price,OpenInterest\nESH5,4810.00,120000\n",
    );

    let store = FsObjectStore::new(dir.path(), VENDOR, PRODUCT);
    let mut db = Database::open(":memory:").unwrap();
    db.init_schema().unwrap();

    for d in [d1, d2] {
        let meta = store.head(Exchange::Cme, d).await.unwrap();
        let reader = store
            .fetch(Exchange::Cme, d)
            .await
            .unwrap()
            .into_reader()
            .unwrap();
        db::bulk_load_csv(&mut db.conn, Exchange::Cme, d, &meta.path, reader, Utc::now()).unwrap();
    }

    // Both slices live in the one bronze table; day one reads NULL for the
    // column day two introduced.
    assert_eq!(db::bronze_slice_count(&db.conn, Exchange::Cme, d1).unwrap(), 1);
    assert_eq!(db::bronze_slice_count(&db.conn, Exchange::Cme, d2).unwrap(), 1);
    let oi: Option<String> = db
        .conn
        .query_row(
            "SELECT \"OpenInterest\" FROM cme_market_data_raw WHERE data_date = '2025-01-15'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(oi.is_none());
}
