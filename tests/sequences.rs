use anyhow::Result;
use bulkflow::{Error, SequenceKey, SequenceRange, SequenceSource, Store};
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::task::JoinSet;

#[tokio::test]
async fn ranges_are_contiguous_and_disjoint_under_concurrency() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let store = Store::connect(&url).await?;
    bulkflow::testing::migrate_core_schema(store.pool()).await?;
    let seqs = store.sequences();

    let key = SequenceKey::new("acme/north", "vendor");
    assert_eq!(seqs.current(&key).await?, None);
    assert_eq!(
        seqs.next_range(&key, 5).await?,
        SequenceRange { start: 1, end: 5 }
    );
    assert_eq!(
        seqs.next_range(&key, 3).await?,
        SequenceRange { start: 6, end: 8 }
    );
    assert_eq!(seqs.current(&key).await?, Some(8));

    // zero is rejected and leaves the counter alone
    let err = seqs.next_range(&key, 0).await.expect_err("zero count");
    assert!(matches!(err, Error::InvalidSequenceCount));
    assert_eq!(seqs.current(&key).await?, Some(8));

    // another scope starts from one
    let other = SequenceKey::new("acme/south", "vendor");
    assert_eq!(seqs.next_range(&other, 1).await?.start, 1);

    let shared = SequenceKey::new("acme", "agent");
    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let seqs = seqs.clone();
        let key = shared.clone();
        tasks.spawn(async move { seqs.next_range(&key, 5).await });
    }
    let mut ranges = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        ranges.push(joined??);
    }
    ranges.sort_by_key(|r| r.start);
    for pair in ranges.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]));
        assert_eq!(pair[0].end + 1, pair[1].start);
    }
    assert_eq!(ranges.first().map(|r| r.start), Some(1));
    assert_eq!(ranges.last().map(|r| r.end), Some(80));
    assert_eq!(seqs.current(&shared).await?, Some(80));

    Ok(())
}
