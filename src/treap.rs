// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

// Interval treap for collecting live VL areas.
//
// Nodes live in an arena and point at each other by index; randomized
// priorities keep the expected height logarithmic. Inserting an interval
// that touches an existing one merges the two; inserting one that overlaps
// an existing one is an integrity violation and is rejected.

use rand::Rng;
use crate::error::{Error, Result};

struct Node {
	start: u64,
	len: u64,
	prio: u64,
	left: Option<usize>,
	right: Option<usize>,
}

impl Node {
	fn end(&self) -> u64 {
		self.start + self.len
	}
}

#[derive(Default)]
pub struct IntervalTreap {
	nodes: Vec<Node>,
	root: Option<usize>,
	total: u64,
}

impl IntervalTreap {
	pub fn new() -> IntervalTreap {
		Default::default()
	}

	/// Sum of all interval lengths.
	pub fn total(&self) -> u64 {
		self.total
	}

	fn node(&self, i: usize) -> &Node {
		&self.nodes[i]
	}

	/// The interval with the greatest start at or below `start`.
	fn predecessor(&self, start: u64) -> Option<usize> {
		let mut best = None;
		let mut at = self.root;
		while let Some(i) = at {
			if self.node(i).start <= start {
				best = Some(i);
				at = self.node(i).right;
			} else {
				at = self.node(i).left;
			}
		}
		best
	}

	/// The interval with the smallest start above `start`.
	fn successor(&self, start: u64) -> Option<usize> {
		let mut best = None;
		let mut at = self.root;
		while let Some(i) = at {
			if self.node(i).start > start {
				best = Some(i);
				at = self.node(i).left;
			} else {
				at = self.node(i).right;
			}
		}
		best
	}

	/// Adds `[start, start + len)`. Touching neighbours merge; overlapping
	/// neighbours are a corruption of the caller's data.
	pub fn insert(&mut self, start: u64, len: u64) -> Result<()> {
		if len == 0 {
			return Ok(());
		}
		let end = start.checked_add(len).ok_or_else(|| {
			Error::Corruption(format!("interval at {} of {} bytes wraps around", start, len))
		})?;
		let pred = self.predecessor(start);
		let succ = self.successor(start);
		if let Some(p) = pred {
			if self.node(p).end() > start {
				return Err(Error::Corruption(format!(
					"area [{}, {}) overlaps [{}, {})",
					start, end, self.node(p).start, self.node(p).end()
				)));
			}
		}
		if let Some(s) = succ {
			if end > self.node(s).start {
				return Err(Error::Corruption(format!(
					"area [{}, {}) overlaps [{}, {})",
					start, end, self.node(s).start, self.node(s).end()
				)));
			}
		}
		self.total += len;
		let merge_left = pred.map_or(false, |p| self.node(p).end() == start);
		let merge_right = succ.map_or(false, |s| self.node(s).start == end);
		match (merge_left, merge_right) {
			(true, true) => {
				let p = pred.unwrap_or(0);
				let s = succ.unwrap_or(0);
				let tail = self.node(s).len;
				self.nodes[p].len += len + tail;
				let key = self.nodes[s].start;
				self.root = self.remove(self.root, key);
			}
			(true, false) => {
				let p = pred.unwrap_or(0);
				self.nodes[p].len += len;
			}
			(false, true) => {
				// The key shrinks toward the gap it fills; ordering against
				// the predecessor is preserved because they do not touch.
				let s = succ.unwrap_or(0);
				self.nodes[s].start = start;
				self.nodes[s].len += len;
			}
			(false, false) => {
				let prio = rand::thread_rng().gen::<u64>();
				self.nodes.push(Node { start, len, prio, left: None, right: None });
				let fresh = self.nodes.len() - 1;
				self.root = Some(self.insert_node(self.root, fresh));
			}
		}
		Ok(())
	}

	fn insert_node(&mut self, at: Option<usize>, fresh: usize) -> usize {
		let i = match at {
			None => return fresh,
			Some(i) => i,
		};
		if self.nodes[fresh].start < self.nodes[i].start {
			let child = self.insert_node(self.nodes[i].left, fresh);
			self.nodes[i].left = Some(child);
			if self.nodes[child].prio > self.nodes[i].prio {
				return self.rotate_right(i);
			}
		} else {
			let child = self.insert_node(self.nodes[i].right, fresh);
			self.nodes[i].right = Some(child);
			if self.nodes[child].prio > self.nodes[i].prio {
				return self.rotate_left(i);
			}
		}
		i
	}

	fn rotate_right(&mut self, i: usize) -> usize {
		let l = self.nodes[i].left.unwrap_or(i);
		self.nodes[i].left = self.nodes[l].right;
		self.nodes[l].right = Some(i);
		l
	}

	fn rotate_left(&mut self, i: usize) -> usize {
		let r = self.nodes[i].right.unwrap_or(i);
		self.nodes[i].right = self.nodes[r].left;
		self.nodes[r].left = Some(i);
		r
	}

	fn remove(&mut self, at: Option<usize>, key: u64) -> Option<usize> {
		let i = at?;
		if key < self.nodes[i].start {
			let left = self.remove(self.nodes[i].left, key);
			self.nodes[i].left = left;
			Some(i)
		} else if key > self.nodes[i].start {
			let right = self.remove(self.nodes[i].right, key);
			self.nodes[i].right = right;
			Some(i)
		} else {
			match (self.nodes[i].left, self.nodes[i].right) {
				(None, None) => None,
				(Some(l), None) => Some(l),
				(None, Some(r)) => Some(r),
				(Some(l), Some(r)) => {
					if self.nodes[l].prio > self.nodes[r].prio {
						let top = self.rotate_right(i);
						let right = self.remove(self.nodes[top].right, key);
						self.nodes[top].right = right;
						Some(top)
					} else {
						let top = self.rotate_left(i);
						let left = self.remove(self.nodes[top].left, key);
						self.nodes[top].left = left;
						Some(top)
					}
				}
			}
		}
	}

	/// The intervals in ascending order of start.
	pub fn sorted(&self) -> Vec<(u64, u64)> {
		let mut out = Vec::new();
		let mut stack = Vec::new();
		let mut at = self.root;
		while at.is_some() || !stack.is_empty() {
			while let Some(i) = at {
				stack.push(i);
				at = self.node(i).left;
			}
			if let Some(i) = stack.pop() {
				out.push((self.node(i).start, self.node(i).len));
				at = self.node(i).right;
			}
		}
		out
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn inserts_sorted_and_totaled() {
		let mut t = IntervalTreap::new();
		t.insert(50, 5).unwrap();
		t.insert(10, 5).unwrap();
		t.insert(30, 5).unwrap();
		assert_eq!(t.sorted(), vec![(10, 5), (30, 5), (50, 5)]);
		assert_eq!(t.total(), 15);
	}

	#[test]
	fn merges_adjacent_both_sides() {
		let mut t = IntervalTreap::new();
		t.insert(10, 5).unwrap();
		t.insert(20, 5).unwrap();
		// Fills the hole exactly, collapsing to one interval.
		t.insert(15, 5).unwrap();
		assert_eq!(t.sorted(), vec![(10, 15)]);
		assert_eq!(t.total(), 15);
	}

	#[test]
	fn merges_left_and_right_separately() {
		let mut t = IntervalTreap::new();
		t.insert(10, 5).unwrap();
		t.insert(15, 3).unwrap();
		assert_eq!(t.sorted(), vec![(10, 8)]);
		t.insert(30, 4).unwrap();
		t.insert(26, 4).unwrap();
		assert_eq!(t.sorted(), vec![(10, 8), (26, 8)]);
	}

	#[test]
	fn rejects_overlap() {
		let mut t = IntervalTreap::new();
		t.insert(10, 10).unwrap();
		assert!(matches!(t.insert(15, 2), Err(Error::Corruption(_))));
		assert!(matches!(t.insert(5, 6), Err(Error::Corruption(_))));
		assert!(matches!(t.insert(10, 10), Err(Error::Corruption(_))));
	}

	#[test]
	fn random_fill_stays_consistent() {
		use rand::seq::SliceRandom;
		let mut order: Vec<u64> = (0..200).collect();
		order.shuffle(&mut rand::thread_rng());
		let mut t = IntervalTreap::new();
		for i in order {
			t.insert(8 + i * 10, 10).unwrap();
		}
		// Every interval touches its neighbours, so everything merges.
		assert_eq!(t.sorted(), vec![(8, 2000)]);
		assert_eq!(t.total(), 2000);
	}
}
