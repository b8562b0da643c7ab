//! ORB Vocabulary for Bag-of-Words matching and relocalization.
//!
//! A hierarchical k-means tree over ORB descriptors, read from the DBoW2
//! text format (`ORBvoc.txt`). Tracking uses it twice: feature vectors
//! restrict descriptor comparisons to features sharing a tree node, and BoW
//! vectors rank keyframes when the camera has to be relocalized.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::tracking::frame::{descriptor_distance, Descriptor};

/// Bag-of-Words vector: word id -> TF-IDF weight, L1-normalized.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: tree node id -> indices of the features below it.
pub type FeatureVector = HashMap<u32, Vec<usize>>;

#[derive(Debug, Clone)]
struct Node {
    /// `None` for the root.
    parent: Option<u32>,
    children: Vec<u32>,
    centroid: Descriptor,
    /// IDF weight, meaningful on leaves only.
    weight: f64,
    word: Option<u32>,
}

impl Node {
    fn root() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            centroid: [0u8; 32],
            weight: 0.0,
            word: None,
        }
    }
}

#[derive(Debug)]
pub struct OrbVocabulary {
    /// nodes[0] is the root.
    nodes: Vec<Node>,
    /// Leaf node id of each word.
    word_nodes: Vec<u32>,
    branching: usize,
    depth: usize,
}

impl OrbVocabulary {
    /// Load a DBoW2 text vocabulary.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf d0 d1 ... d31 weight
    /// ```
    ///
    /// Node lines come in breadth-first order and get ids 1, 2, ... in the
    /// order they appear. The real ORB vocabulary takes several seconds.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open vocabulary file {:?}", path))?;
        let vocab = Self::from_text_reader(BufReader::new(file))
            .with_context(|| format!("Invalid vocabulary file {:?}", path))?;
        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            vocab.branching,
            vocab.depth,
            vocab.nodes.len(),
            vocab.word_nodes.len()
        );
        Ok(vocab)
    }

    pub fn from_text_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => bail!("empty vocabulary"),
        };
        let mut fields = header.split_whitespace();
        let (Some(k), Some(l)) = (fields.next(), fields.next()) else {
            bail!("header must start with `k L`, got {:?}", header);
        };
        let branching: usize = k.parse().with_context(|| format!("bad branching factor {:?}", k))?;
        let depth: usize = l.parse().with_context(|| format!("bad depth {:?}", l))?;

        let mut vocab = Self {
            nodes: vec![Node::root()],
            word_nodes: Vec::new(),
            branching,
            depth,
        };

        for (n, line) in lines.enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 35 {
                bail!("node line {} has {} fields, expected 35", n + 2, fields.len());
            }
            let parent: u32 = fields[0]
                .parse()
                .with_context(|| format!("bad parent on line {}", n + 2))?;
            let mut centroid = [0u8; 32];
            for (byte, text) in centroid.iter_mut().zip(&fields[2..34]) {
                *byte = text.parse().with_context(|| format!("bad descriptor byte on line {}", n + 2))?;
            }
            let weight: f64 = fields[34]
                .parse()
                .with_context(|| format!("bad weight on line {}", n + 2))?;
            vocab.push_node(parent, centroid, weight, fields[1] == "1")?;
        }
        Ok(vocab)
    }

    /// Build a one-level vocabulary whose words are the given descriptors,
    /// all weighted equally.
    ///
    /// Every leaf hangs off the root, so feature vectors collapse to a single
    /// group and BoW matching degenerates into exhaustive matching.
    pub fn from_words(words: &[Descriptor]) -> Self {
        let mut vocab = Self {
            nodes: vec![Node::root()],
            word_nodes: Vec::with_capacity(words.len()),
            branching: words.len(),
            depth: 1,
        };
        for desc in words {
            // The root always exists
            let _ = vocab.push_node(0, *desc, 1.0, true);
        }
        vocab
    }

    fn push_node(&mut self, parent: u32, centroid: Descriptor, weight: f64, leaf: bool) -> Result<()> {
        let id = self.nodes.len() as u32;
        let Some(parent_node) = self.nodes.get_mut(parent as usize) else {
            bail!("node {} refers to unknown parent {}", id, parent);
        };
        parent_node.children.push(id);

        let word = leaf.then(|| {
            self.word_nodes.push(id);
            self.word_nodes.len() as u32 - 1
        });
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            centroid,
            weight,
            word,
        });
        Ok(())
    }

    pub fn branching(&self) -> usize {
        self.branching
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn num_words(&self) -> usize {
        self.word_nodes.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend from the root along the closest centroid. Returns the leaf
    /// node id.
    fn leaf_of(&self, desc: &Descriptor) -> u32 {
        let mut node = 0u32;
        loop {
            let children = &self.nodes[node as usize].children;
            let closest = children
                .iter()
                .copied()
                .min_by_key(|&c| descriptor_distance(desc, &self.nodes[c as usize].centroid));
            match closest {
                Some(c) => node = c,
                None => return node,
            }
        }
    }

    /// Ancestor `levels_up` steps above `node`, stopping at the root.
    fn ancestor(&self, mut node: u32, levels_up: usize) -> u32 {
        for _ in 0..levels_up {
            match self.nodes[node as usize].parent {
                Some(p) => node = p,
                None => break,
            }
        }
        node
    }

    /// Quantize descriptors into an L1-normalized BoW vector and a feature
    /// vector grouped `levels_up` levels above the leaves.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();
        if self.word_nodes.is_empty() {
            return (bow, features);
        }

        for (i, desc) in descriptors.iter().enumerate() {
            let leaf = self.leaf_of(desc);
            let node = &self.nodes[leaf as usize];
            if let Some(word) = node.word {
                *bow.entry(word).or_insert(0.0) += node.weight;
            }
            features.entry(self.ancestor(leaf, levels_up)).or_default().push(i);
        }

        let total: f64 = bow.values().sum();
        if total > 0.0 {
            bow.values_mut().for_each(|v| *v /= total);
        }
        (bow, features)
    }

    /// L1 similarity of two normalized BoW vectors, in [0, 1].
    ///
    /// Uses the identity `|a - b| = a + b - 2 min(a, b)` summed over shared
    /// words, which for normalized vectors gives `1 - 0.5 |v1 - v2|_1`.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let (small, large) = if v1.len() <= v2.len() { (v1, v2) } else { (v2, v1) };
        small
            .iter()
            .filter_map(|(word, &a)| large.get(word).map(|&b| a.min(b)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn words() -> Vec<Descriptor> {
        (0..4usize)
            .map(|w| {
                let mut d = [0u8; 32];
                d[w * 8..(w + 1) * 8].fill(0xff);
                d
            })
            .collect()
    }

    fn node_line(parent: u32, leaf: bool, fill: u8, weight: f64) -> String {
        let bytes: Vec<String> = (0..32).map(|_| fill.to_string()).collect();
        format!("{} {} {} {}", parent, leaf as u8, bytes.join(" "), weight)
    }

    #[test]
    fn test_flat_vocabulary_transform() {
        let vocab = OrbVocabulary::from_words(&words());
        assert_eq!(vocab.num_words(), 4);
        assert_eq!((vocab.branching(), vocab.depth()), (4, 1));

        let mut near_word2 = words()[2];
        near_word2[20] = 0x0f;
        let descs = vec![words()[0], near_word2, words()[2]];
        let (bow, fv) = vocab.transform(&descs, 4);

        assert_eq!(bow.len(), 2);
        assert_relative_eq!(bow[&0], 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(bow[&2], 2.0 / 3.0, epsilon = 1e-12);
        // All leaves share the root
        assert_eq!(fv.len(), 1);
        assert_eq!(fv[&0], vec![0, 1, 2]);
    }

    #[test]
    fn test_parses_two_level_tree() {
        // root -> {1: 0x00, 2: 0xff}, 1 -> {3, 4}, 2 -> {5, 6}
        let text = [
            "2 2 0 0".to_string(),
            node_line(0, false, 0x00, 0.0),
            node_line(0, false, 0xff, 0.0),
            node_line(1, true, 0x00, 1.0),
            node_line(1, true, 0x0f, 2.0),
            node_line(2, true, 0xf0, 3.0),
            node_line(2, true, 0xff, 4.0),
        ]
        .join("\n");
        let vocab = OrbVocabulary::from_text_reader(text.as_bytes()).unwrap();
        assert_eq!(vocab.num_nodes(), 7);
        assert_eq!(vocab.num_words(), 4);

        let (bow, fv) = vocab.transform(&[[0xff; 32], [0x07; 32]], 1);
        // Word 3 (weight 4) and word 1 (weight 2)
        assert_relative_eq!(bow[&3], 4.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(bow[&1], 2.0 / 6.0, epsilon = 1e-12);
        assert_eq!(fv[&2], vec![0]);
        assert_eq!(fv[&1], vec![1]);
    }

    #[test]
    fn test_rejects_malformed_vocabulary() {
        assert!(OrbVocabulary::from_text_reader("".as_bytes()).is_err());
        assert!(OrbVocabulary::from_text_reader("10".as_bytes()).is_err());
        let orphan = format!("10 6 0 0\n{}", node_line(7, true, 0, 1.0));
        assert!(OrbVocabulary::from_text_reader(orphan.as_bytes()).is_err());
    }

    #[test]
    fn test_bow_score() {
        let v1: BowVector = [(0, 0.5), (1, 0.5)].into_iter().collect();
        let v2 = v1.clone();
        assert_relative_eq!(OrbVocabulary::score(&v1, &v2), 1.0, epsilon = 1e-12);

        let v3: BowVector = [(2, 0.5), (3, 0.5)].into_iter().collect();
        assert_relative_eq!(OrbVocabulary::score(&v1, &v3), 0.0);

        let v4: BowVector = [(0, 0.25), (2, 0.75)].into_iter().collect();
        assert_relative_eq!(OrbVocabulary::score(&v1, &v4), 0.25, epsilon = 1e-12);
    }
}
