use anyhow::Result;
use oorandom::Rand32;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use QuiverCGI::index::{compare_bytes, Key, OrderedIndex};

/// Ключи из маленького алфавита и коротких длин: много дубликатов и префиксов.
fn random_key(rng: &mut Rand32) -> Vec<u8> {
    let len = rng.rand_range(0..5) as usize;
    (0..len).map(|_| b'a' + rng.rand_range(0..3) as u8).collect()
}

fn in_order(tree: &OrderedIndex<u32>) -> Vec<(Vec<u8>, u32)> {
    tree.iter()
        .map(|(k, v)| (k.as_bytes().expect("string key").to_vec(), *v))
        .collect()
}

/// Эталон: BTreeMap (первая запись побеждает), отсортированный компаратором строк.
fn reference(model: &BTreeMap<Vec<u8>, u32>) -> Vec<(Vec<u8>, u32)> {
    let mut v: Vec<(Vec<u8>, u32)> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
    v.sort_by(|a, b| compare_bytes(&a.0, &b.0));
    v
}

#[test]
fn comparator_prefix_rule() {
    assert_eq!(compare_bytes(b"abc", b"abd"), Ordering::Less);
    assert_eq!(compare_bytes(b"ab", b"abc"), Ordering::Greater);
    assert_eq!(compare_bytes(b"abc", b"ab"), Ordering::Less);
    assert_eq!(compare_bytes(b"", b"a"), Ordering::Greater);
    assert_eq!(compare_bytes(b"ab", b"ab"), Ordering::Equal);

    // разные теги: Str < Int < Ident
    assert!(Key::str("zzz") < Key::Int(-5));
    assert!(Key::Int(i64::MAX) < Key::Ident(0));
    assert!(Key::Int(-1) < Key::Int(1));
}

#[test]
fn duplicate_insert_is_noop() -> Result<()> {
    let mut t = OrderedIndex::new();
    let a = t.insert(Key::str("x"), 1u32).expect("first insert");
    assert!(t.insert(Key::str("x"), 2).is_none());
    assert_eq!(t.len(), 1);
    assert_eq!(t.value(a), Some(&1));
    assert_eq!(t.get_str(b"x"), Some(&1));

    // префикс другой длины - другой ключ
    assert!(t.insert(Key::str("xy"), 3).is_some());
    assert_eq!(t.len(), 2);
    t.check_invariants().map_err(anyhow::Error::msg)?;
    Ok(())
}

#[test]
fn random_insert_delete_matches_reference() -> Result<()> {
    for seed in [1u64, 7, 42, 0xC0FFEE, 0xDEADBEEF] {
        let mut rng = Rand32::new(seed);
        let mut tree: OrderedIndex<u32> = OrderedIndex::new();
        let mut model: BTreeMap<Vec<u8>, u32> = BTreeMap::new();

        for step in 0..2000u32 {
            let key = random_key(&mut rng);
            if rng.rand_range(0..3) < 2 {
                let inserted = tree.insert(Key::Str(key.clone()), step).is_some();
                let fresh = !model.contains_key(&key);
                assert_eq!(inserted, fresh, "seed={} step={}", seed, step);
                model.entry(key).or_insert(step);
            } else {
                let removed = match tree.find(&Key::Str(key.clone())) {
                    Some(id) => tree.delete(id).map(|(_, v)| v),
                    None => None,
                };
                assert_eq!(removed, model.remove(&key), "seed={} step={}", seed, step);
            }

            tree.check_invariants()
                .map_err(|e| anyhow::anyhow!("seed={} step={}: {}", seed, step, e))?;
            assert_eq!(tree.len(), model.len());
        }

        assert_eq!(in_order(&tree), reference(&model), "seed={}", seed);
        for (k, v) in &model {
            assert_eq!(tree.get_str(k), Some(v));
        }
    }
    Ok(())
}

#[test]
fn drain_by_first_keeps_invariants() -> Result<()> {
    let mut rng = Rand32::new(99);
    let mut tree = OrderedIndex::new();
    for i in 0..500i64 {
        tree.insert(Key::Int(rng.rand_i32() as i64), i);
    }
    let mut prev: Option<Key> = None;
    while let Some(id) = tree.first() {
        let (k, _) = tree.delete(id).expect("delete first");
        if let Some(p) = &prev {
            assert!(p < &k, "first() must yield ascending keys");
        }
        prev = Some(k);
        tree.check_invariants().map_err(anyhow::Error::msg)?;
    }
    assert!(tree.is_empty());
    Ok(())
}
