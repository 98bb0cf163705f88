use crate::address::{keccak256, Address};
use crate::error::{DecodeError, Error};
use crate::units::TokenAmount;

const WORD: usize = 32;

/// Selector of the standard `Error(string)` revert payload.
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// An argument value for [`encode_call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(TokenAmount),
    AddressArray(Vec<Address>),
}

/// Compute the 4-byte selector from a canonical function signature.
pub fn selector_from_signature(canonical: &str) -> [u8; 4] {
    let hash = keccak256(canonical.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode a call: selector, head words, then the tail of any dynamic
/// arguments.
pub fn encode_call(canonical: &str, args: &[Token]) -> Result<Vec<u8>, Error> {
    let mut head = Vec::with_capacity(args.len() * WORD);
    let mut tail = Vec::new();
    let head_len = args.len() * WORD;

    for arg in args {
        match arg {
            Token::Address(addr) => head.extend_from_slice(&address_word(addr)),
            Token::Uint(amount) => head.extend_from_slice(&amount.to_word()?),
            Token::AddressArray(items) => {
                head.extend_from_slice(&usize_word(head_len + tail.len()));
                tail.extend_from_slice(&usize_word(items.len()));
                for item in items {
                    tail.extend_from_slice(&address_word(item));
                }
            }
        }
    }

    let mut data = Vec::with_capacity(4 + head.len() + tail.len());
    data.extend_from_slice(&selector_from_signature(canonical));
    data.extend_from_slice(&head);
    data.extend_from_slice(&tail);
    Ok(data)
}

fn address_word(addr: &Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(addr.as_bytes());
    word
}

fn usize_word(n: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&(n as u64).to_be_bytes());
    word
}

/// Decode a single `uint` return value.
pub fn decode_uint(data: &[u8]) -> Result<TokenAmount, DecodeError> {
    ensure_bytes(data, 0, WORD)?;
    Ok(TokenAmount::from_be_bytes(&data[..WORD]))
}

/// Decode a `uint8` return value, rejecting anything wider.
pub fn decode_u8(data: &[u8]) -> Result<u8, DecodeError> {
    ensure_bytes(data, 0, WORD)?;
    if data[..WORD - 1].iter().any(|&b| b != 0) {
        return Err(DecodeError::OutOfRange("value exceeds uint8".to_string()));
    }
    Ok(data[WORD - 1])
}

/// Decode a single `uint256[]` return value.
pub fn decode_uint_array(data: &[u8]) -> Result<Vec<TokenAmount>, DecodeError> {
    let offset = read_usize(data, 0)?;
    let len = read_usize(data, offset)?;
    let start = offset + WORD;
    let byte_len = len
        .checked_mul(WORD)
        .ok_or_else(|| DecodeError::InvalidEncoding("array length overflow".to_string()))?;
    ensure_bytes(data, start, byte_len)?;

    Ok(data[start..start + byte_len]
        .chunks_exact(WORD)
        .map(TokenAmount::from_be_bytes)
        .collect())
}

/// Extract the message from `Error(string)` revert data, if that is
/// what `data` holds.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(&ERROR_STRING_SELECTOR[..])?;
    let offset = read_usize(payload, 0).ok()?;
    let len = read_usize(payload, offset).ok()?;
    let start = offset + WORD;
    ensure_bytes(payload, start, len).ok()?;
    std::str::from_utf8(&payload[start..start + len])
        .ok()
        .map(str::to_string)
}

/// Encode `Error(string)` revert data.
pub fn encode_revert_reason(reason: &str) -> Vec<u8> {
    let mut data = ERROR_STRING_SELECTOR.to_vec();
    data.extend_from_slice(&usize_word(WORD));
    data.extend_from_slice(&usize_word(reason.len()));
    data.extend_from_slice(reason.as_bytes());
    let pad = (WORD - reason.len() % WORD) % WORD;
    data.extend(std::iter::repeat_n(0u8, pad));
    data
}

fn read_usize(data: &[u8], offset: usize) -> Result<usize, DecodeError> {
    ensure_bytes(data, offset, WORD)?;
    let word = &data[offset..offset + WORD];
    // Offsets and lengths must fit in usize
    if word[..24].iter().any(|&b| b != 0) {
        return Err(DecodeError::InvalidEncoding(
            "offset too large for usize".to_string(),
        ));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[24..WORD]);
    usize::try_from(u64::from_be_bytes(bytes))
        .map_err(|_| DecodeError::InvalidEncoding("offset too large for usize".to_string()))
}

fn ensure_bytes(data: &[u8], offset: usize, len: usize) -> Result<(), DecodeError> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| DecodeError::InvalidEncoding("length overflow".to_string()))?;
    if end > data.len() {
        return Err(DecodeError::DataTooShort {
            expected: end,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Encode a list of `uint256` values the way a contract returns
/// `uint256[]`.
pub fn encode_uint_array(values: &[TokenAmount]) -> Result<Vec<u8>, Error> {
    let mut data = Vec::with_capacity(WORD * (values.len() + 2));
    data.extend_from_slice(&usize_word(WORD));
    data.extend_from_slice(&usize_word(values.len()));
    for value in values {
        data.extend_from_slice(&value.to_word()?);
    }
    Ok(data)
}
