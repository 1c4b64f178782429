use super::traits::Tokenizer;
use super::{TokenType, Vocabulary};
use crate::core::TokenId;
use once_cell::sync::Lazy;
use std::collections::HashMap;

static PRETOKENIZE: Lazy<fancy_regex::Regex> = Lazy::new(|| {
    fancy_regex::Regex::new(
        r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+"
    )
    .expect("pre-tokenizer pattern compiles")
});

/// GPT-2 byte-level BPE: text is split into words, each word's bytes are mapped
/// onto printable code points, then merged pairwise by merge rank.
pub struct BpeTokenizer {
    vocab: Vocabulary,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    // longest first so overlapping specials resolve to the longer one
    specials: Vec<(String, TokenId)>,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let byte_encoder = Self::build_byte_encoder();
        let byte_decoder = byte_encoder.iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        let mut bpe_ranks = HashMap::with_capacity(vocab.merges.len());
        for (i, merge) in vocab.merges.iter().enumerate() {
            if let Some((left, right)) = merge.split_once(' ') {
                bpe_ranks.insert((left.to_string(), right.to_string()), i);
            }
        }

        let mut specials = vocab.special_tokens();
        specials.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1 .0.cmp(&b.1 .0)));

        Self {
            vocab,
            bpe_ranks,
            byte_encoder,
            byte_decoder,
            specials,
        }
    }

    /// Printable bytes map to themselves, the rest to code points from 256 up.
    fn build_byte_encoder() -> [char; 256] {
        let printable = |b: u8| matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);

        let mut table = ['\0'; 256];
        let mut next = 256u32;
        for b in 0..=255u8 {
            table[b as usize] = if printable(b) {
                char::from(b)
            } else {
                let c = char::from_u32(next).unwrap_or(char::REPLACEMENT_CHARACTER);
                next += 1;
                c
            };
        }
        table
    }

    fn get_pairs(word: &[String]) -> Vec<(String, String)> {
        word.windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect()
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        if word.len() < 2 {
            return word;
        }

        loop {
            let pairs = Self::get_pairs(&word);
            let bigram = pairs.iter()
                .filter_map(|pair| self.bpe_ranks.get(pair).map(|&rank| (pair, rank)))
                .min_by_key(|(_, rank)| *rank)
                .map(|(pair, _)| pair.clone());

            let Some(bigram) = bigram else { break };

            let mut new_word = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == bigram.0 && word[i + 1] == bigram.1 {
                    new_word.push(format!("{}{}", word[i], word[i + 1]));
                    i += 2;
                } else {
                    new_word.push(word[i].clone());
                    i += 1;
                }
            }
            word = new_word;
            if word.len() < 2 {
                break;
            }
        }
        word
    }

    fn byte_encode(&self, text: &str) -> String {
        text.bytes().map(|b| self.byte_encoder[b as usize]).collect()
    }

    fn encode_plain(&self, text: &str, out: &mut Vec<TokenId>) {
        for piece in PRETOKENIZE.find_iter(text).flatten() {
            let encoded = self.byte_encode(piece.as_str());
            for bpe_token in self.bpe(&encoded) {
                if let Some(id) = self.vocab.id(&bpe_token) {
                    out.push(id);
                    continue;
                }
                // no merge path reached a vocab entry; fall back to single symbols
                for c in bpe_token.chars() {
                    let mut buf = [0u8; 4];
                    if let Some(id) = self.vocab.id(c.encode_utf8(&mut buf)) {
                        out.push(id);
                    }
                }
            }
        }
    }

    fn next_special(&self, text: &str) -> Option<(usize, &str, TokenId)> {
        self.specials.iter()
            .filter_map(|(s, id)| text.find(s.as_str()).map(|pos| (pos, s.as_str(), *id)))
            .min_by_key(|(pos, s, _)| (*pos, std::cmp::Reverse(s.len())))
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        let mut rest = text;

        while let Some((pos, special, id)) = self.next_special(rest) {
            self.encode_plain(&rest[..pos], &mut tokens);
            tokens.push(id);
            rest = &rest[pos + special.len()..];
        }
        self.encode_plain(rest, &mut tokens);

        tokens
    }

    fn token_bytes(&self, id: TokenId) -> Vec<u8> {
        let Some(text) = self.vocab.token(id) else {
            return Vec::new();
        };

        match self.vocab.token_type(id) {
            TokenType::Control | TokenType::UserDefined => text.as_bytes().to_vec(),
            _ => {
                let mut bytes = Vec::with_capacity(text.len());
                for c in text.chars() {
                    match self.byte_decoder.get(&c) {
                        Some(&b) => bytes.push(b),
                        None => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        }
                    }
                }
                bytes
            }
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab.size()
    }

    fn bos_token(&self) -> TokenId {
        self.vocab.bos_token
    }

    fn eos_token(&self) -> TokenId {
        self.vocab.eos_token
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.vocab.id(token)
    }

    fn id_to_token(&self, id: TokenId) -> Option<&str> {
        self.vocab.token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> BpeTokenizer {
        let tokens = ["h", "e", "l", "o", "Ġ", "w", "r", "d", "he", "ll", "hell", "hello", "Ġw", "Ġwo", "or", "Ġwor", "Ġworld", "ld", "<|endoftext|>"];
        let mut types = vec![TokenType::Normal; tokens.len()];
        types[tokens.len() - 1] = TokenType::Control;
        let merges = ["h e", "l l", "he ll", "hell o", "Ġ w", "o r", "Ġw or", "l d", "Ġwor ld"];

        let vocab = Vocabulary::new(tokens.iter().map(|s| s.to_string()).collect())
            .with_types(types)
            .with_merges(merges.iter().map(|s| s.to_string()).collect());
        BpeTokenizer::new(vocab)
    }

    #[test]
    fn test_bpe_merges() {
        let tok = tokenizer();
        let ids = tok.encode("hello world");
        let pieces: Vec<&str> = ids.iter().filter_map(|&id| tok.id_to_token(id)).collect();
        assert_eq!(pieces, vec!["hello", "Ġworld"]);
        assert_eq!(tok.decode(&ids), "hello world");
    }

    #[test]
    fn test_special_tokens_matched_literally() {
        let tok = tokenizer();
        let eot = tok.token_to_id("<|endoftext|>").unwrap();
        let ids = tok.encode("hello<|endoftext|>hello");
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[1], eot);
        assert_eq!(tok.decode(&ids), "hello<|endoftext|>hello");
    }

    #[test]
    fn test_deterministic() {
        let tok = tokenizer();
        assert_eq!(tok.encode("hello world hello"), tok.encode("hello world hello"));
    }

    #[test]
    fn test_out_of_vocab_is_empty() {
        let tok = tokenizer();
        assert!(tok.token_bytes(TokenId(1000)).is_empty());
        assert!(tok.token_bytes(TokenId(-3)).is_empty());
    }

    #[test]
    fn test_byte_encoder_is_bijective() {
        let table = BpeTokenizer::build_byte_encoder();
        let unique: std::collections::HashSet<char> = table.iter().copied().collect();
        assert_eq!(unique.len(), 256);
        assert_eq!(table[b'a' as usize], 'a');
        assert_eq!(table[b' ' as usize], 'Ġ');
    }
}
