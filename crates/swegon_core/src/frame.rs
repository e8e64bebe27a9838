//! Enquadramento binário do protocolo Swegon.
//!
//! Um datagrama UDP pode carregar vários frames concatenados. Formato de
//! cada frame:
//!
//! ```text
//! ┌──────┬──────┬─────┬──────┬─────┬─────┬─────┬─────┬─────────────┬─────────┐
//! │ 0xCC │ 0x64 │ pad │ dest │ src │ len │ tipo│ pad │ Payload (N) │ CRC(BE) │
//! └──────┴──────┴─────┴──────┴─────┴─────┴─────┴─────┴─────────────┴─────────┘
//! ```
//!
//! - Marcador `0xCC 0x64` delimita frames dentro do datagrama
//! - "Mensagem" é tudo entre o `0xCC` inicial e os 2 bytes de CRC
//! - CRC-16/CCITT-FALSE calculado sobre a mensagem, big-endian no fio

use std::fmt;

/// Marcador de início de frame.
pub const MARKER: [u8; 2] = [0xCC, 0x64];

/// Tamanho do header da mensagem (a partir do `0x64`).
pub const HEADER_SIZE: usize = 8;

/// Tamanho do CRC no final do frame.
const CRC_SIZE: usize = 2;

/// Frames com até este tamanho são descartados como malformados.
pub const MIN_FRAME_LEN: usize = 10;

/// Erros de enquadramento.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame malformado ({len} bytes, primeiro byte 0x{first_byte:02X})")]
    Malformed { len: usize, first_byte: u8 },

    #[error("CRC inválido: 0x{declared:04X} (frame) != 0x{computed:04X} (calculado)")]
    ChecksumMismatch { declared: u16, computed: u16 },

    #[error("Header muito curto ({0} bytes, mínimo {HEADER_SIZE})")]
    HeaderTooShort(usize),
}

const CRC_TABLE: [u16; 256] = crc_table();

const fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, sem reflexão, xorout 0).
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &byte| {
        let index = ((crc >> 8) ^ byte as u16) & 0xFF;
        (crc << 8) ^ CRC_TABLE[index as usize]
    })
}

/// Separa um datagrama nos frames candidatos.
///
/// Cada ocorrência do [`MARKER`] inicia um candidato; o marcador é
/// recolocado na frente de cada fragmento não vazio. Bytes antes do
/// primeiro marcador não formam frame.
pub fn split_datagram(data: &[u8]) -> Vec<Vec<u8>> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + MARKER.len() <= data.len() {
        if data[i..i + MARKER.len()] == MARKER {
            starts.push(i);
            i += MARKER.len();
        } else {
            i += 1;
        }
    }

    let mut frames = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(data.len());
        let fragment = &data[start + MARKER.len()..end];
        if fragment.is_empty() {
            continue;
        }
        let mut frame = Vec::with_capacity(MARKER.len() + fragment.len());
        frame.extend_from_slice(&MARKER);
        frame.extend_from_slice(fragment);
        frames.push(frame);
    }
    frames
}

/// Verifica tamanho, marcador e CRC de um frame candidato.
///
/// Retorna a mensagem (sem o `0xCC` inicial e sem o CRC) quando válido.
pub fn verify_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() <= MIN_FRAME_LEN || frame[0] != MARKER[0] {
        return Err(FrameError::Malformed {
            len: frame.len(),
            first_byte: frame.first().copied().unwrap_or(0),
        });
    }

    let crc_start = frame.len() - CRC_SIZE;
    let declared = u16::from_be_bytes([frame[crc_start], frame[crc_start + 1]]);
    let message = &frame[1..crc_start];
    let computed = crc16_ccitt_false(message);

    if declared != computed {
        return Err(FrameError::ChecksumMismatch { declared, computed });
    }
    Ok(message)
}

/// Identidade de uma mensagem para throttling e histórico de diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub msg_type: u8,
    pub source: u8,
    pub destination: u8,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}: {:02X}->{:02X}",
            self.msg_type, self.source, self.destination
        )
    }
}

/// Mensagem verificada com o header já separado do payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub first_byte: u8,
    pub destination: u8,
    pub source: u8,
    /// Tamanho declarado no header. Não é validado contra o payload real.
    pub data_len: u8,
    pub msg_type: u8,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// Separa header e payload de uma mensagem retornada por [`verify_frame`].
    pub fn parse(message: &'a [u8]) -> Result<Self, FrameError> {
        if message.len() < HEADER_SIZE {
            return Err(FrameError::HeaderTooShort(message.len()));
        }
        Ok(Self {
            first_byte: message[0],
            destination: message[2],
            source: message[3],
            data_len: message[4],
            msg_type: message[5],
            payload: &message[HEADER_SIZE..],
        })
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            msg_type: self.msg_type,
            source: self.source,
            destination: self.destination,
        }
    }
}

/// Monta um frame completo (marcador, header, payload e CRC).
///
/// Usado por simuladores e testes; o receptor nunca transmite.
pub fn encode_frame(destination: u8, source: u8, msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&MARKER);
    frame.extend_from_slice(&[
        0x00,
        destination,
        source,
        payload.len() as u8,
        msg_type,
        0x00,
        0x00,
    ]);
    frame.extend_from_slice(payload);
    let crc = crc16_ccitt_false(&frame[1..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
