//! Allocation-free, locale-independent formatting for use inside signal
//! handlers.
//!
//! [`format`] understands a small `printf` subset: the `d`, `i`, `u`, `x`,
//! `p` and `s` conversions with optional `l`/`ll` length modifiers. Width
//! and precision are not supported. Output is truncated to fit the buffer
//! and is always NUL-terminated.
use std::ffi::{c_long, CStr};
use std::mem;

/// Size of the scratch buffer needed by [`int_to_string`] and
/// [`uint_to_string`] for any 64-bit value, terminator included.
pub const DIGITS_LEN: usize = 22;

const DIGITS: &[u8; 16] = b"0123456789abcdef";
const HEX_WIDTH: usize = 16;
const NULL_STR: &[u8] = b"(null)";

// Whether `%l` alone selects a 64-bit argument, and whether `%p` does.
const LONG_IS_WIDE: bool = mem::size_of::<c_long>() == mem::size_of::<i64>();
const POINTER_IS_WIDE: bool = mem::size_of::<usize>() == mem::size_of::<i64>();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Radix {
    Decimal = 10,
    Hex = 16,
}

/// Writes the digits of `value` backwards, ending at `buf.len()`, and
/// returns the index of the first digit.
fn write_digits(radix: Radix, mut value: u64, buf: &mut [u8]) -> usize {
    let base = radix as u64;
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = DIGITS[(value % base) as usize];
        value /= base;
        if value == 0 {
            return pos;
        }
    }
}

// 0 <-> f, 1 <-> e, ..., 7 <-> 8
fn complement_digit(digit: u8) -> u8 {
    let nibble = match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => return digit,
    };
    DIGITS[15 - nibble as usize]
}

/// Converts an unsigned value to text at the end of `buf`.
///
/// The returned slice excludes the NUL terminator, which is written
/// immediately after it.
pub fn uint_to_string(radix: Radix, value: u64, buf: &mut [u8; DIGITS_LEN]) -> &[u8] {
    let end = DIGITS_LEN - 1;
    buf[end] = 0;
    let start = write_digits(radix, value, &mut buf[..end]);
    &buf[start..end]
}

/// Converts a signed value to text at the end of `buf`.
///
/// Negative decimal values get a leading `-`. Negative hex values come out
/// as their 16-digit two's complement: `-1` is `ffffffffffffffff`.
pub fn int_to_string(radix: Radix, value: i64, buf: &mut [u8; DIGITS_LEN]) -> &[u8] {
    let end = DIGITS_LEN - 1;
    buf[end] = 0;
    if value >= 0 {
        let start = write_digits(radix, value as u64, &mut buf[..end]);
        return &buf[start..end];
    }

    let magnitude = value.unsigned_abs();
    match radix {
        Radix::Decimal => {
            let start = write_digits(radix, magnitude, &mut buf[..end]) - 1;
            buf[start] = b'-';
            &buf[start..end]
        }
        Radix::Hex => {
            // ~x == -x - 1, so complementing the digits of |x| - 1 gives x.
            // |x| - 1 always fits in 16 digits, even for i64::MIN.
            let start = end - HEX_WIDTH;
            buf[start..end].fill(b'0');
            write_digits(radix, magnitude - 1, &mut buf[..end]);
            for digit in &mut buf[start..end] {
                *digit = complement_digit(*digit);
            }
            &buf[start..end]
        }
    }
}

/// One argument to [`format`].
///
/// Integers are stored at full width and narrowed according to the
/// conversion that consumes them, the way a C vararg would be read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arg<'a> {
    Int(i64),
    Uint(u64),
    Str(Option<&'a [u8]>),
}

impl Arg<'_> {
    fn as_i64(self) -> i64 {
        match self {
            Arg::Int(v) => v,
            Arg::Uint(v) => v as i64,
            Arg::Str(_) => 0,
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Arg::Int(v) => v as u64,
            Arg::Uint(v) => v,
            Arg::Str(_) => 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Arg::Str(Some(s)) => s,
            _ => NULL_STR,
        }
    }
}

macro_rules! arg_from {
    ($variant:ident as $wide:ty: $($t:ty),*) => {
        $(impl From<$t> for Arg<'_> {
            fn from(value: $t) -> Self {
                Arg::$variant(value as $wide)
            }
        })*
    };
}

arg_from!(Int as i64: i8, i16, i32, i64, isize);
arg_from!(Uint as u64: u8, u16, u32, u64, usize);

impl<T> From<*const T> for Arg<'_> {
    fn from(value: *const T) -> Self {
        Arg::Uint(value as usize as u64)
    }
}

impl<T> From<*mut T> for Arg<'_> {
    fn from(value: *mut T) -> Self {
        Arg::Uint(value as usize as u64)
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Str(Some(value))
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Str(Some(value.as_bytes()))
    }
}

impl<'a> From<&'a CStr> for Arg<'a> {
    fn from(value: &'a CStr) -> Self {
        Arg::Str(Some(value.to_bytes()))
    }
}

impl<'a> From<Option<&'a [u8]>> for Arg<'a> {
    fn from(value: Option<&'a [u8]>) -> Self {
        Arg::Str(value)
    }
}

impl<'a> From<Option<&'a str>> for Arg<'a> {
    fn from(value: Option<&'a str>) -> Self {
        Arg::Str(value.map(str::as_bytes))
    }
}

/// Parses an optional `l` or `ll` at `fmt[pos..]`. Returns whether the
/// argument is 64 bits wide and the position of the conversion character.
fn length_modifier(fmt: &[u8], pos: usize) -> (bool, usize) {
    match (fmt.get(pos), fmt.get(pos + 1)) {
        (Some(b'l'), Some(b'l')) => (true, pos + 2),
        (Some(b'l'), _) => (LONG_IS_WIDE, pos + 1),
        _ => (false, pos),
    }
}

fn copy_truncated(to: &mut [u8], from: &[u8]) -> usize {
    let n = to.len().min(from.len());
    to[..n].copy_from_slice(&from[..n]);
    n
}

/// Formats `fmt` with `args` into `buf`.
///
/// Returns the number of bytes written, not counting the terminating NUL,
/// which is always written when `buf` is non-empty. At most
/// `buf.len() - 1` bytes of text are produced; anything more is dropped
/// silently. Missing arguments read as `0` or `"(null)"`, and unknown
/// conversions produce no output.
pub fn format(buf: &mut [u8], fmt: &str, args: &[Arg<'_>]) -> usize {
    let end = match buf.len().checked_sub(1) {
        Some(end) => end,
        None => return 0,
    };
    let fmt = fmt.as_bytes();
    let mut args = args.iter().copied();
    let mut out = 0;
    let mut pos = 0;

    while pos < fmt.len() {
        let c = fmt[pos];
        pos += 1;
        if c != b'%' {
            if out == end {
                break;
            }
            buf[out] = c;
            out += 1;
            continue;
        }

        let (mut wide, conv_pos) = length_modifier(fmt, pos);
        let conv = match fmt.get(conv_pos) {
            Some(&conv) => conv,
            None => break,
        };
        pos = conv_pos + 1;

        match conv {
            b'd' | b'i' | b'u' | b'x' | b'p' => {
                let arg = args.next().unwrap_or(Arg::Int(0));
                if conv == b'p' {
                    wide = POINTER_IS_WIDE;
                }
                let radix = if conv == b'x' || conv == b'p' {
                    Radix::Hex
                } else {
                    Radix::Decimal
                };
                let mut digits = [0u8; DIGITS_LEN];
                let text = if conv == b'u' {
                    let value = arg.as_u64();
                    let value = if wide { value } else { value as u32 as u64 };
                    uint_to_string(radix, value, &mut digits)
                } else {
                    let value = arg.as_i64();
                    let value = if wide { value } else { value as i32 as i64 };
                    let text = int_to_string(radix, value, &mut digits);
                    // A narrow negative value was sign extended: drop the
                    // leading "ffffffff" so it prints as 8 digits.
                    if radix == Radix::Hex && !wide && value < 0 {
                        &text[8..]
                    } else {
                        text
                    }
                };
                out += copy_truncated(&mut buf[out..end], text);
            }
            b's' => {
                let arg = args.next().unwrap_or(Arg::Str(None));
                out += copy_truncated(&mut buf[out..end], arg.as_bytes());
            }
            _ => {}
        }
    }

    buf[out] = 0;
    out
}

/// Formats with [`format`], converting each argument with `Arg::from`.
///
/// ```
/// let mut buf = [0u8; 32];
/// let len = crashtrace::safe_format!(&mut buf, "#%d: %s", 3i32, "main");
/// assert_eq!(&buf[..len], b"#3: main");
/// ```
#[macro_export]
macro_rules! safe_format {
    ($buf:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::signal_safe::format($buf, $fmt, &[$($crate::signal_safe::Arg::from($arg)),*])
    };
}

/// A fixed-capacity buffer that lives on the stack for the duration of one
/// formatting operation.
pub struct FormatBuffer<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FormatBuffer<N> {
    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    /// Replaces the contents with the formatted text and returns it.
    pub fn format(&mut self, fmt: &str, args: &[Arg<'_>]) -> &[u8] {
        self.len = format(&mut self.bytes, fmt, args);
        self.as_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for FormatBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
