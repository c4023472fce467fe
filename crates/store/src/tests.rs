use camino::Utf8PathBuf;
use tempdir::TempDir;

use mesh_primitives::{Graph, Lex, Node, Soul, Value};
use mesh_radisk::RadiskOptions;

use super::{GetOptions, Store};

async fn open(dir: &TempDir) -> Store {
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
    Store::open(RadiskOptions::new(path))
        .await
        .expect("open should succeed")
}

fn mark_graph() -> Graph {
    let soul = Soul::from("mark");
    let mut node = Node::new(soul.clone());
    node.set("age", Value::Number(23.0), 2.0);
    node.set("boss", Value::Relation(Soul::from("amber")), 3.0);
    node.set("name", Value::from("Mark"), 1.0);
    Graph::single(soul, node)
}

#[tokio::test]
async fn put_then_get_whole_node() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;

    store.put(&mark_graph()).await?;
    store.flush().await?;

    let graph = store
        .get(&Lex::node("mark"), GetOptions::default())
        .await?
        .expect("node should be found");
    let node = graph.get(&Soul::from("mark")).expect("soul present");

    assert_eq!(node.value("name"), Some(&Value::from("Mark")));
    assert_eq!(node.state("name"), Some(1.0));
    assert_eq!(node.value("age"), Some(&Value::Number(23.0)));
    assert_eq!(
        node.value("boss"),
        Some(&Value::Relation(Soul::from("amber")))
    );
    Ok(())
}

#[tokio::test]
async fn get_exact_field_restricts_the_node() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;
    store.put(&mark_graph()).await?;

    let graph = store
        .get(&Lex::field("mark", "name"), GetOptions::default())
        .await?
        .expect("field should be found");
    let node = graph.get(&Soul::from("mark")).expect("soul present");

    assert_eq!(node.value("name"), Some(&Value::from("Mark")));
    assert_eq!(node.value("age"), None);
    assert_eq!(node.field_count(), 1);
    Ok(())
}

#[tokio::test]
async fn get_prefix_and_range() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;

    let soul = Soul::from("list");
    let mut node = Node::new(soul.clone());
    for field in ["aa", "ab", "ba", "bb"] {
        node.set(field, Value::from(field), 1.0);
    }
    store.put(&Graph::single(soul.clone(), node)).await?;

    let prefix = store
        .get(&Lex::prefix("list", "a"), GetOptions::default())
        .await?
        .expect("prefix should match");
    let node = prefix.get(&soul).expect("soul present");
    assert_eq!(node.field_count(), 2);
    assert!(node.value("aa").is_some());
    assert!(node.value("ab").is_some());

    let range = store
        .get(
            &Lex::range("list", Some("ab".to_owned()), Some("ba".to_owned())),
            GetOptions::default(),
        )
        .await?
        .expect("range should match");
    let node = range.get(&soul).expect("soul present");
    assert_eq!(node.field_count(), 2);
    assert!(node.value("ab").is_some());
    assert!(node.value("ba").is_some());
    Ok(())
}

#[tokio::test]
async fn missing_soul_reads_as_none() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;
    assert!(store
        .get(&Lex::node("nobody"), GetOptions::default())
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn tombstones_survive_and_read_as_null() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;

    let soul = Soul::from("mark");
    let mut node = Node::new(soul.clone());
    node.set("name", Value::Null, 9.0);
    store.put(&Graph::single(soul.clone(), node)).await?;
    store.flush().await?;

    let graph = store
        .get(&Lex::field("mark", "name"), GetOptions::default())
        .await?
        .expect("tombstone is still a record");
    let node = graph.get(&soul).expect("soul present");
    assert_eq!(node.value("name"), Some(&Value::Null));
    assert_eq!(node.state("name"), Some(9.0));
    Ok(())
}

#[tokio::test]
async fn signatures_round_trip_and_gate_secure_reads() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;

    let soul = Soul::from("~somepub");
    let mut node = Node::new(soul.clone());
    node.set("name", Value::from("Mark"), 1.0);
    node.sign(1.0, "sig-bytes".to_owned());
    node.set("unsigned", Value::from("sneak"), 2.0);
    store.put(&Graph::single(soul.clone(), node)).await?;

    // A plain read returns both fields, the signature back under the
    // state it was made at.
    let graph = store
        .get(&Lex::node("~somepub"), GetOptions::default())
        .await?
        .expect("node should be found");
    let node = graph.get(&soul).expect("soul present");
    assert_eq!(node.sig(1.0), Some("sig-bytes"));
    assert!(node.sig(2.0).is_none());
    assert!(node.value("unsigned").is_some());

    // A secure read withholds the unsigned field.
    let graph = store
        .get(&Lex::node("~somepub"), GetOptions { secure: true })
        .await?
        .expect("signed field should remain");
    let node = graph.get(&soul).expect("soul present");
    assert!(node.value("name").is_some());
    assert!(node.value("unsigned").is_none());
    Ok(())
}

#[tokio::test]
async fn unflushed_puts_are_readable() -> eyre::Result<()> {
    let dir = TempDir::new("store")?;
    let mut store = open(&dir).await;

    store.put(&mark_graph()).await?;
    // No flush: the radisk batch must serve the read.
    let graph = store
        .get(&Lex::field("mark", "age"), GetOptions::default())
        .await?;
    assert!(graph.is_some());
    Ok(())
}
