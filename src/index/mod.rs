//! Упорядоченный индекс: red-black дерево на арене узлов.
//!
//! Используется одинаково для таблицы конфигурации, таблицы маршрутов (dispatch) и ACL.
//!
//! Design:
//! - Узлы лежат в Vec<Option<Node>>; NodeId - индекс слота, освобождённые слоты переиспользуются.
//! - Родитель и цвет упакованы в одно u32: ((parent + 1) << 1) | color, 0 в старших битах - нет родителя.
//! - insert(): точный дубликат ключа (с учётом длины) отвергается - None, дерево не меняется
//!   ("первая запись побеждает"). Перезапись - через find() + value_mut().
//! - delete(): стандартное RB-удаление с продвижением преемника при двух детях и последующим
//!   delete_color() (повороты/перекраска до восстановления инвариантов или до корня).
//!
//! Инварианты после каждой мутации: корень чёрный; нет красного узла с красным ребёнком;
//! одинаковая чёрная высота на всех путях; in-order обход отсортирован компаратором Key.
//! check_invariants() проверяет всё это (используется в тестах).

pub mod key;

pub use key::{compare_bytes, Key};

use std::cmp::Ordering;

const RED: u32 = 0;
const BLACK: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

struct Node<V> {
    parent_color: u32,
    left: Option<NodeId>,
    right: Option<NodeId>,
    key: Key,
    value: V,
}

#[inline]
fn pack(parent: Option<NodeId>, color: u32) -> u32 {
    let p = parent.map(|p| p.0 + 1).unwrap_or(0);
    (p << 1) | color
}

pub struct OrderedIndex<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<u32>,
    root: Option<NodeId>,
    len: usize,
}

impl<V> Default for OrderedIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedIndex<V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Вставка. None - точный дубликат уже есть, дерево не изменено.
    pub fn insert(&mut self, key: Key, value: V) -> Option<NodeId> {
        let mut parent = None;
        let mut go_left = false;
        let mut cur = self.root;
        while let Some(c) = cur {
            match key.cmp(&self.node(c).key) {
                Ordering::Less => {
                    parent = Some(c);
                    go_left = true;
                    cur = self.node(c).left;
                }
                Ordering::Greater => {
                    parent = Some(c);
                    go_left = false;
                    cur = self.node(c).right;
                }
                Ordering::Equal => return None,
            }
        }

        let id = self.alloc_node(Node {
            parent_color: pack(parent, RED),
            left: None,
            right: None,
            key,
            value,
        });
        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.insert_color(id);
        self.len += 1;
        Some(id)
    }

    pub fn find(&self, key: &Key) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            match key.cmp(&n.key) {
                Ordering::Less => cur = n.left,
                Ordering::Greater => cur = n.right,
                Ordering::Equal => return Some(c),
            }
        }
        None
    }

    /// find() для строкового ключа без аллокации Key на стороне вызывающего.
    pub fn find_str(&self, key: &[u8]) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            let ord = match &n.key {
                Key::Str(k) => compare_bytes(key, k),
                _ => Ordering::Less,
            };
            match ord {
                Ordering::Less => cur = n.left,
                Ordering::Greater => cur = n.right,
                Ordering::Equal => return Some(c),
            }
        }
        None
    }

    pub fn get(&self, key: &Key) -> Option<&V> {
        self.find(key).map(|id| &self.node(id).value)
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&V> {
        self.find_str(key).map(|id| &self.node(id).value)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.find(key).is_some()
    }

    pub fn key(&self, id: NodeId) -> Option<&Key> {
        self.slot(id).map(|n| &n.key)
    }

    pub fn value(&self, id: NodeId) -> Option<&V> {
        self.slot(id).map(|n| &n.value)
    }

    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut V> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(|n| n.as_mut())
            .map(|n| &mut n.value)
    }

    /// Удалить узел. Возвращает (ключ, значение) или None для устаревшего id.
    pub fn delete(&mut self, z: NodeId) -> Option<(Key, V)> {
        self.slot(z)?;

        let mut y_color = self.color(z);
        let x;
        let x_parent;

        match (self.left(z), self.right(z)) {
            (None, right) => {
                x = right;
                x_parent = self.parent(z);
                self.transplant(z, right);
            }
            (left @ Some(_), None) => {
                x = left;
                x_parent = self.parent(z);
                self.transplant(z, left);
            }
            (Some(zl), Some(zr)) => {
                let y = self.minimum(zr);
                y_color = self.color(y);
                x = self.right(y);
                if self.parent(y) == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.parent(y);
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(zr);
                    self.set_parent(zr, Some(y));
                }
                self.transplant(z, Some(y));
                self.node_mut(y).left = Some(zl);
                self.set_parent(zl, Some(y));
                let zc = self.color(z);
                self.set_color(y, zc);
            }
        }

        if y_color == BLACK {
            self.delete_color(x, x_parent);
        }

        self.len -= 1;
        self.free.push(z.0);
        self.nodes[z.0 as usize].take().map(|n| (n.key, n.value))
    }

    /// Удалить по ключу.
    pub fn remove(&mut self, key: &Key) -> Option<V> {
        let id = self.find(key)?;
        self.delete(id).map(|(_, v)| v)
    }

    pub fn first(&self) -> Option<NodeId> {
        self.root.map(|r| self.minimum(r))
    }

    /// In-order преемник.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        if let Some(r) = self.right(id) {
            return Some(self.minimum(r));
        }
        let mut cur = id;
        let mut parent = self.parent(cur);
        while let Some(p) = parent {
            if self.right(p) != Some(cur) {
                break;
            }
            cur = p;
            parent = self.parent(p);
        }
        parent
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            index: self,
            cur: self.first(),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.len = 0;
    }

    /// Проверка RB-инвариантов. Ok(чёрная высота) или описание нарушения.
    pub fn check_invariants(&self) -> Result<usize, String> {
        let Some(root) = self.root else {
            return if self.len == 0 {
                Ok(0)
            } else {
                Err(format!("empty root but len={}", self.len))
            };
        };
        if self.color(root) != BLACK {
            return Err("root is red".to_string());
        }
        if self.parent(root).is_some() {
            return Err("root has a parent".to_string());
        }
        let mut count = 0usize;
        let bh = self.check_subtree(root, &mut count)?;
        if count != self.len {
            return Err(format!("len={} but {} nodes reachable", self.len, count));
        }
        Ok(bh)
    }

    // ---------------- internals ----------------

    fn check_subtree(&self, id: NodeId, count: &mut usize) -> Result<usize, String> {
        *count += 1;
        let red = self.color(id) == RED;
        let mut heights = [0usize; 2];
        for (i, child) in [self.left(id), self.right(id)].into_iter().enumerate() {
            let Some(c) = child else {
                heights[i] = 1;
                continue;
            };
            if self.parent(c) != Some(id) {
                return Err(format!("broken parent link at {:?}", c));
            }
            if red && self.color(c) == RED {
                return Err(format!("red node {:?} has red child {:?}", id, c));
            }
            let ord = self.node(c).key.cmp(&self.node(id).key);
            let want = if i == 0 { Ordering::Less } else { Ordering::Greater };
            if ord != want {
                return Err(format!("order violated between {:?} and {:?}", id, c));
            }
            heights[i] = self.check_subtree(c, count)?;
        }
        if heights[0] != heights[1] {
            return Err(format!(
                "black height mismatch at {:?}: {} vs {}",
                id, heights[0], heights[1]
            ));
        }
        Ok(heights[0] + usize::from(!red))
    }

    fn alloc_node(&mut self, node: Node<V>) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                NodeId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn slot(&self, id: NodeId) -> Option<&Node<V>> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    // Внутренние id всегда указывают на живые узлы.
    fn node(&self, id: NodeId) -> &Node<V> {
        match &self.nodes[id.0 as usize] {
            Some(n) => n,
            None => panic!("ordered index: dangling node {:?}", id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        match &mut self.nodes[id.0 as usize] {
            Some(n) => n,
            None => panic!("ordered index: dangling node {:?}", id),
        }
    }

    #[inline]
    fn parent(&self, id: NodeId) -> Option<NodeId> {
        match self.node(id).parent_color >> 1 {
            0 => None,
            p => Some(NodeId(p - 1)),
        }
    }

    #[inline]
    fn color(&self, id: NodeId) -> u32 {
        self.node(id).parent_color & 1
    }

    #[inline]
    fn is_red(&self, id: Option<NodeId>) -> bool {
        id.map(|n| self.color(n) == RED).unwrap_or(false)
    }

    #[inline]
    fn left(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left
    }

    #[inline]
    fn right(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        let color = self.color(id);
        self.node_mut(id).parent_color = pack(parent, color);
    }

    fn set_color(&mut self, id: NodeId, color: u32) {
        let parent = self.parent(id);
        self.node_mut(id).parent_color = pack(parent, color);
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.left(id) {
            id = l;
        }
        id
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.left(p) == Some(old) {
                    self.node_mut(p).left = new;
                } else {
                    self.node_mut(p).right = new;
                }
            }
        }
    }

    fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
        let up = self.parent(u);
        self.replace_child(up, u, v);
        if let Some(v) = v {
            self.set_parent(v, up);
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.right(x) else { return };
        let y_left = self.left(y);
        self.node_mut(x).right = y_left;
        if let Some(b) = y_left {
            self.set_parent(b, Some(x));
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        self.replace_child(xp, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.set_parent(x, Some(y));
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.left(x) else { return };
        let y_right = self.right(y);
        self.node_mut(x).left = y_right;
        if let Some(b) = y_right {
            self.set_parent(b, Some(x));
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        self.replace_child(xp, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.set_parent(x, Some(y));
    }

    fn insert_color(&mut self, mut node: NodeId) {
        loop {
            let Some(mut parent) = self.parent(node) else { break };
            if self.color(parent) == BLACK {
                break;
            }
            let Some(gparent) = self.parent(parent) else { break };

            if self.left(gparent) == Some(parent) {
                let uncle = self.right(gparent);
                if let Some(u) = uncle.filter(|&u| self.color(u) == RED) {
                    self.set_color(u, BLACK);
                    self.set_color(parent, BLACK);
                    self.set_color(gparent, RED);
                    node = gparent;
                    continue;
                }
                if self.right(parent) == Some(node) {
                    self.rotate_left(parent);
                    std::mem::swap(&mut node, &mut parent);
                }
                self.set_color(parent, BLACK);
                self.set_color(gparent, RED);
                self.rotate_right(gparent);
            } else {
                let uncle = self.left(gparent);
                if let Some(u) = uncle.filter(|&u| self.color(u) == RED) {
                    self.set_color(u, BLACK);
                    self.set_color(parent, BLACK);
                    self.set_color(gparent, RED);
                    node = gparent;
                    continue;
                }
                if self.left(parent) == Some(node) {
                    self.rotate_right(parent);
                    std::mem::swap(&mut node, &mut parent);
                }
                self.set_color(parent, BLACK);
                self.set_color(gparent, RED);
                self.rotate_left(gparent);
            }
        }
        if let Some(root) = self.root {
            self.set_color(root, BLACK);
        }
    }

    fn delete_color(&mut self, mut node: Option<NodeId>, mut parent: Option<NodeId>) {
        while node != self.root && !self.is_red(node) {
            let Some(p) = parent else { break };

            if self.left(p) == node {
                let Some(mut w) = self.right(p) else { break };
                if self.color(w) == RED {
                    self.set_color(w, BLACK);
                    self.set_color(p, RED);
                    self.rotate_left(p);
                    let Some(nw) = self.right(p) else { break };
                    w = nw;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_color(w, RED);
                    node = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.right(w)) {
                        if let Some(wl) = self.left(w) {
                            self.set_color(wl, BLACK);
                        }
                        self.set_color(w, RED);
                        self.rotate_right(w);
                        let Some(nw) = self.right(p) else { break };
                        w = nw;
                    }
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, BLACK);
                    if let Some(wr) = self.right(w) {
                        self.set_color(wr, BLACK);
                    }
                    self.rotate_left(p);
                    node = self.root;
                    parent = None;
                }
            } else {
                let Some(mut w) = self.left(p) else { break };
                if self.color(w) == RED {
                    self.set_color(w, BLACK);
                    self.set_color(p, RED);
                    self.rotate_right(p);
                    let Some(nw) = self.left(p) else { break };
                    w = nw;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_color(w, RED);
                    node = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.left(w)) {
                        if let Some(wr) = self.right(w) {
                            self.set_color(wr, BLACK);
                        }
                        self.set_color(w, RED);
                        self.rotate_left(w);
                        let Some(nw) = self.left(p) else { break };
                        w = nw;
                    }
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, BLACK);
                    if let Some(wl) = self.left(w) {
                        self.set_color(wl, BLACK);
                    }
                    self.rotate_right(p);
                    node = self.root;
                    parent = None;
                }
            }
        }
        if let Some(n) = node {
            self.set_color(n, BLACK);
        }
    }
}

/// In-order обход (ключ, значение).
pub struct Iter<'a, V> {
    index: &'a OrderedIndex<V>,
    cur: Option<NodeId>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a Key, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        self.cur = self.index.next(id);
        let n = self.index.node(id);
        Some((&n.key, &n.value))
    }
}
