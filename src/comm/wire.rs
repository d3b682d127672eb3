// src/comm/wire.rs
//
// Flat little-endian encoding for values that cross a process boundary.
// Lengths travel as u64, usize as u64, bool as one byte.

use std::collections::BTreeMap;

use rustfft::num_complex::Complex;

pub trait Wire: Sized {
    fn encode(&self, out: &mut Vec<u8>);

    /// Read one value off the front of `input`; None on short or bad input.
    fn decode(input: &mut &[u8]) -> Option<Self>;
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if input.len() < n {
        return None;
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Some(head)
}

macro_rules! wire_le {
    ($($t:ty),*) => {$(
        impl Wire for $t {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn decode(input: &mut &[u8]) -> Option<Self> {
                let bytes = take(input, std::mem::size_of::<$t>())?;
                Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
            }
        }
    )*};
}

wire_le!(f64, u64, u32, i64);

impl Wire for usize {
    fn encode(&self, out: &mut Vec<u8>) {
        (*self as u64).encode(out);
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        usize::try_from(u64::decode(input)?).ok()
    }
}

impl Wire for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        match take(input, 1)?[0] {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }
}

impl Wire for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.len().encode(out);
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        let n = usize::decode(input)?;
        String::from_utf8(take(input, n)?.to_vec()).ok()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.len().encode(out);
        for v in self {
            v.encode(out);
        }
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        let n = usize::decode(input)?;
        // every element takes at least one byte
        let mut out = Vec::with_capacity(n.min(input.len()));
        for _ in 0..n {
            out.push(T::decode(input)?);
        }
        Some(out)
    }
}

impl<T: Wire + Copy + Default, const N: usize> Wire for [T; N] {
    fn encode(&self, out: &mut Vec<u8>) {
        for v in self {
            v.encode(out);
        }
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        let mut out = [T::default(); N];
        for v in out.iter_mut() {
            *v = T::decode(input)?;
        }
        Some(out)
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        Some((A::decode(input)?, B::decode(input)?))
    }
}

impl<K: Wire + Ord, V: Wire> Wire for BTreeMap<K, V> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.len().encode(out);
        for (k, v) in self {
            k.encode(out);
            v.encode(out);
        }
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        let n = usize::decode(input)?;
        let mut out = BTreeMap::new();
        for _ in 0..n {
            let k = K::decode(input)?;
            out.insert(k, V::decode(input)?);
        }
        Some(out)
    }
}

impl Wire for Complex<f64> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.re.encode(out);
        self.im.encode(out);
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        Some(Complex::new(f64::decode(input)?, f64::decode(input)?))
    }
}
