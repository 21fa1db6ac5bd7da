//! Minimal Solidity ABI encoding for the calls this crate builds.

use alloy_primitives::{Address, B256, U256};

/// An ABI value.
#[derive(Debug, Clone)]
pub(crate) enum Token {
    Address(Address),
    Uint(U256),
    Word(B256),
    Bytes(Vec<u8>),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Self::Bytes(_) | Self::Array(_) => true,
            Self::Tuple(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    fn head_size(&self) -> usize {
        match self {
            Self::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_size).sum(),
            _ => 32,
        }
    }
}

/// `abi.encode(tokens...)`.
pub(crate) fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_size).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&word_usize(head_len + tail.len()));
            tail.extend(encode_single(token));
        } else {
            head.extend(encode_single(token));
        }
    }

    head.extend(tail);
    head
}

/// Selector followed by `abi.encode(args...)`.
pub(crate) fn encode_call(selector: [u8; 4], args: &[Token]) -> Vec<u8> {
    let mut out = selector.to_vec();
    out.extend(encode(args));
    out
}

fn encode_single(token: &Token) -> Vec<u8> {
    match token {
        Token::Address(address) => address.into_word().to_vec(),
        Token::Uint(value) => value.to_be_bytes::<32>().to_vec(),
        Token::Word(word) => word.to_vec(),
        Token::Bytes(bytes) => {
            let mut out = word_usize(bytes.len()).to_vec();
            out.extend_from_slice(bytes);
            out.resize(32 + padded_len(bytes.len()), 0);
            out
        }
        Token::Array(items) => {
            let mut out = word_usize(items.len()).to_vec();
            out.extend(encode(items));
            out
        }
        Token::Tuple(items) => encode(items),
    }
}

fn word_usize(value: usize) -> [u8; 32] {
    U256::from(value).to_be_bytes::<32>()
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(32) * 32
}
