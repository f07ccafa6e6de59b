//! FIT CRC-16
//!
//! The FIT checksum is CRC-16/ARC (reflected polynomial 0xA001, zero initial
//! value, no final xor), computed a nibble at a time. Because the initial
//! value is zero the CRC is linear, which lets the encoder combine the header
//! CRC with the streaming data CRC without reading the data again.

const CRC_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

const POLY_REFLECTED: u16 = 0xA001;

fn update_byte(mut crc: u16, byte: u8) -> u16 {
    let tmp = CRC_TABLE[(crc & 0xF) as usize];
    crc = (crc >> 4) & 0x0FFF;
    crc = crc ^ tmp ^ CRC_TABLE[(byte & 0xF) as usize];

    let tmp = CRC_TABLE[(crc & 0xF) as usize];
    crc = (crc >> 4) & 0x0FFF;
    crc ^ tmp ^ CRC_TABLE[((byte >> 4) & 0xF) as usize]
}

/// Streaming CRC over bytes in the order they are emitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16 {
    value: u16,
    len: u64,
}

impl Crc16 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.value = data.iter().fold(self.value, |crc, byte| update_byte(crc, *byte));
        self.len += data.len() as u64;
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.value()
}

fn gf2_times(matrix: &[u16; 16], mut vector: u16) -> u16 {
    let mut sum = 0;
    let mut row = 0;
    while vector != 0 {
        if vector & 1 != 0 {
            sum ^= matrix[row];
        }
        vector >>= 1;
        row += 1;
    }
    sum
}

fn gf2_square(matrix: &[u16; 16]) -> [u16; 16] {
    let mut square = [0u16; 16];
    for (n, row) in square.iter_mut().enumerate() {
        *row = gf2_times(matrix, matrix[n]);
    }
    square
}

/// CRC of `A || B` from `crc(A)`, `crc(B)` and the length of `B`
///
/// Runs in O(log len_b) by squaring the "one zero bit" operator.
pub fn combine(crc_a: u16, crc_b: u16, len_b: u64) -> u16 {
    if len_b == 0 {
        return crc_a;
    }

    let mut odd = [0u16; 16];
    odd[0] = POLY_REFLECTED;
    for (n, row) in odd.iter_mut().enumerate().skip(1) {
        *row = 1 << (n - 1);
    }
    let mut even = gf2_square(&odd); // two zero bits
    odd = gf2_square(&even); // four zero bits

    let mut crc = crc_a;
    let mut len = len_b;
    loop {
        even = gf2_square(&odd);
        if len & 1 != 0 {
            crc = gf2_times(&even, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }

        odd = gf2_square(&even);
        if len & 1 != 0 {
            crc = gf2_times(&odd, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }
    }

    crc ^ crc_b
}
