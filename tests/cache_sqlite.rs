//! SQLite judgement cache round-trips.

use tempfile::tempdir;

use storyforge::cache::{JudgementCache, JudgementCacheKey, SqliteJudgementCache};
use storyforge::review::{Comparison, Judgement, Strength};

fn comparisons() -> Vec<Comparison> {
    vec![
        Comparison {
            anchor_id: "A1".into(),
            judgement: Judgement::Better,
            strength: Strength::Medium,
            rationale: "clearer framing".into(),
        },
        Comparison {
            anchor_id: "A2".into(),
            judgement: Judgement::Worse,
            strength: Strength::Strong,
            rationale: "weaker method narrative".into(),
        },
    ]
}

#[tokio::test]
async fn put_then_get_roundtrips() {
    let dir = tempdir().expect("tempdir");
    let cache = SqliteJudgementCache::new(dir.path().join("judgements.sqlite")).expect("cache");

    let key = JudgementCacheKey::new(
        "judge-model",
        "rubric_v1",
        "blind_card_v1",
        "Novelty",
        r#"{"problem":"p"}"#,
        r#"[{"problem":"a1"}]"#,
    );

    assert!(cache.get(&key).await.expect("get").is_none());

    cache.put(&key, &comparisons()).await.expect("put");
    let hit = cache.get(&key).await.expect("get").expect("hit");
    assert_eq!(hit.len(), 2);
    assert_eq!(hit[0].anchor_id, "A1");
    assert_eq!(hit[1].judgement, Judgement::Worse);
    assert_eq!(hit[1].strength, Strength::Strong);
}

#[tokio::test]
async fn different_roles_do_not_collide() {
    let dir = tempdir().expect("tempdir");
    let cache = SqliteJudgementCache::new(dir.path().join("judgements.sqlite")).expect("cache");

    let novelty = JudgementCacheKey::new("m", "r", "c", "Novelty", "{}", "[]");
    let methodology = JudgementCacheKey::new("m", "r", "c", "Methodology", "{}", "[]");

    cache.put(&novelty, &comparisons()).await.expect("put");
    assert!(cache.get(&methodology).await.expect("get").is_none());
}

#[tokio::test]
async fn prune_removes_aged_rows() {
    let dir = tempdir().expect("tempdir");
    let cache = SqliteJudgementCache::new(dir.path().join("judgements.sqlite")).expect("cache");
    let key = JudgementCacheKey::new("m", "r", "c", "Novelty", "{}", "[]");
    cache.put(&key, &comparisons()).await.expect("put");

    // Fresh rows survive a 1-day prune.
    let stats = cache.prune(1).await.expect("prune");
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.remaining, 1);
}
