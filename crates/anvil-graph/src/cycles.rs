use anvil_core::Key;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Shortest-path search through the in-flight dependency-request edges.
///
/// `edges` maps each blocked node to the deps it is currently waiting on;
/// every node records its edges there before blocking, so any genuine cycle
/// is visible to whichever participant records last. Returns the ring
/// starting at `origin`, in traversal order, when `origin` is reachable
/// from one of its own requested deps.
pub fn find_ring(origin: &Key, requested: &[Key], edges: &FxHashMap<Key, Vec<Key>>) -> Option<Vec<Key>> {
    let mut parent: FxHashMap<Key, Key> = FxHashMap::default();
    let mut queue: VecDeque<Key> = VecDeque::new();

    for dep in requested {
        if dep == origin {
            // Self-edge.
            return Some(vec![origin.clone()]);
        }
        if !parent.contains_key(dep) {
            parent.insert(dep.clone(), origin.clone());
            queue.push_back(dep.clone());
        }
    }

    while let Some(current) = queue.pop_front() {
        let Some(next) = edges.get(&current) else {
            continue;
        };
        for dep in next {
            if dep == origin {
                // Reconstruct origin -> ... -> current, which closes back on
                // origin. Breadth-first order makes this the smallest ring
                // through the origin.
                let mut ring = vec![current.clone()];
                let mut cursor = current.clone();
                while let Some(p) = parent.get(&cursor) {
                    if p == origin {
                        break;
                    }
                    ring.push(p.clone());
                    cursor = p.clone();
                }
                ring.push(origin.clone());
                ring.reverse();
                return Some(ring);
            }
            if !parent.contains_key(dep) {
                parent.insert(dep.clone(), current.clone());
                queue.push_back(dep.clone());
            }
        }
    }
    None
}

/// Render a ring for the cycle error, with the domain keys (actions and
/// artifacts) displayed in their own vocabulary.
pub fn render_ring(ring: &[Key]) -> Vec<String> {
    ring.iter().map(|k| k.to_string()).collect()
}
