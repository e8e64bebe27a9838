//! Diff byte a byte entre mensagens sucessivas (modo analisador).
//!
//! Ferramenta de engenharia reversa: para cada [`MessageKey`] guarda a
//! última mensagem e mostra o que mudou, em hex, com cores ANSI.

use crate::frame::MessageKey;
use std::collections::HashMap;
use std::ops::Range;

const BLUE: &str = "\x1b[1;34m";
const RED: &str = "\x1b[1;31m";
const GREEN: &str = "\x1b[0;32m";
const NORMAL: &str = "\x1b[0;0m";

/// Tipo de trecho do diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Equal,
    Replace,
    Delete,
    Insert,
}

/// Trecho `a[a_range]` → `b[b_range]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    pub tag: Tag,
    pub a: Range<usize>,
    pub b: Range<usize>,
}

/// Maior bloco comum dentro das janelas; em empate vence o mais à esquerda.
fn longest_match(
    a: &[u8],
    b: &[u8],
    a_win: Range<usize>,
    b_win: Range<usize>,
) -> (usize, usize, usize) {
    let mut best = (a_win.start, b_win.start, 0);
    let width = b_win.len() + 1;
    let mut prev = vec![0usize; width];
    let mut cur = vec![0usize; width];

    for i in a_win {
        cur.iter_mut().for_each(|k| *k = 0);
        for j in b_win.clone() {
            if a[i] == b[j] {
                let col = j - b_win.start;
                let k = prev[col] + 1;
                cur[col + 1] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    best
}

fn matching_blocks(a: &[u8], b: &[u8]) -> Vec<(usize, usize, usize)> {
    let mut pending = vec![(0..a.len(), 0..b.len())];
    let mut blocks = Vec::new();

    while let Some((a_win, b_win)) = pending.pop() {
        let (i, j, k) = longest_match(a, b, a_win.clone(), b_win.clone());
        if k == 0 {
            continue;
        }
        blocks.push((i, j, k));
        if a_win.start < i && b_win.start < j {
            pending.push((a_win.start..i, b_win.start..j));
        }
        if i + k < a_win.end && j + k < b_win.end {
            pending.push((i + k..a_win.end, j + k..b_win.end));
        }
    }
    blocks.sort_unstable();

    let mut merged: Vec<(usize, usize, usize)> = Vec::with_capacity(blocks.len() + 1);
    for (i, j, k) in blocks {
        if let Some(last) = merged.last_mut() {
            if last.0 + last.2 == i && last.1 + last.2 == j {
                last.2 += k;
                continue;
            }
        }
        merged.push((i, j, k));
    }
    merged.push((a.len(), b.len(), 0));
    merged
}

/// Sequência de operações que transforma `a` em `b`.
pub fn opcodes(a: &[u8], b: &[u8]) -> Vec<Opcode> {
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);

    for (ai, bj, size) in matching_blocks(a, b) {
        let tag = match (i < ai, j < bj) {
            (true, true) => Some(Tag::Replace),
            (true, false) => Some(Tag::Delete),
            (false, true) => Some(Tag::Insert),
            (false, false) => None,
        };
        if let Some(tag) = tag {
            ops.push(Opcode { tag, a: i..ai, b: j..bj });
        }
        i = ai + size;
        j = bj + size;
        if size > 0 {
            ops.push(Opcode {
                tag: Tag::Equal,
                a: ai..i,
                b: bj..j,
            });
        }
    }
    ops
}

/// Renderiza o diff em uma linha, com hex maiúsculo.
///
/// `{old -> new}` para substituição, `{- old}` para remoção e `{+ new}`
/// para inserção.
pub fn inline_diff(a: &[u8], b: &[u8]) -> String {
    let mut out = String::new();
    for op in opcodes(a, b) {
        let old = hex::encode_upper(&a[op.a]);
        let new = hex::encode_upper(&b[op.b]);
        match op.tag {
            Tag::Equal => out.push_str(&old),
            Tag::Replace => out.push_str(&format!("{GREEN}{{{old} -> {new}}}{NORMAL}")),
            Tag::Delete => out.push_str(&format!("{RED}{{- {old}}}{NORMAL}")),
            Tag::Insert => out.push_str(&format!("{BLUE}{{+ {new}}}{NORMAL}")),
        }
    }
    out
}

/// Última mensagem vista por chave. Só cresce; existe apenas em sessões de análise.
#[derive(Debug, Default)]
pub struct DiffHistory {
    last: HashMap<MessageKey, Vec<u8>>,
}

impl DiffHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guarda `message` e devolve o diff contra a anterior da mesma chave.
    pub fn record(&mut self, key: MessageKey, message: &[u8]) -> String {
        let previous = self.last.insert(key, message.to_vec()).unwrap_or_default();
        inline_diff(&previous, message)
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
