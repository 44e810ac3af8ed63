use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{fmt, str::FromStr, time::Duration};

use crate::error::{Error, Result};

/// Track decodificado a partir del payload base64 que entrega el nodo.
///
/// `encoded` es el token opaco que se devuelve al nodo en `play`; el resto
/// son metadatos leídos de ese mismo payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Track {
    pub encoded: String,
    pub title: String,
    pub author: String,
    pub duration_ms: u64,
    pub identifier: String,
    pub is_seekable: bool,
    pub is_stream: bool,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
    pub position_ms: u64,
}

impl Track {
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidTrack(format!("base64 inválido: {}", e)))?;
        let mut reader = DataReader::new(&bytes);

        let header = reader.read_u32()?;
        let flags = (header & 0xC000_0000) >> 30;
        let version = if flags & 1 != 0 { reader.read_u8()? } else { 1 };

        let title = reader.read_utf()?;
        let author = reader.read_utf()?;
        let duration_ms = reader.read_i64()?.max(0) as u64;
        let identifier = reader.read_utf()?;
        let is_stream = reader.read_bool()?;

        let uri = if version >= 2 {
            reader.read_nullable_utf()?
        } else {
            None
        };
        let (artwork_url, isrc) = if version >= 3 {
            (reader.read_nullable_utf()?, reader.read_nullable_utf()?)
        } else {
            (None, None)
        };

        let source_name = reader.read_utf()?;
        let position_ms = reader.read_i64()?.max(0) as u64;

        Ok(Self {
            encoded: encoded.trim().to_string(),
            title,
            author,
            duration_ms,
            identifier,
            is_seekable: !is_stream,
            is_stream,
            uri,
            artwork_url,
            isrc,
            source_name,
            position_ms,
        })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl FromStr for Track {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.author, self.title)
    }
}

/// Formatea una duración como `HH:MM:SS`.
pub fn format_time(time: Duration) -> String {
    let total = time.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Milisegundos separados en días, horas, minutos y segundos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeParts {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

pub fn parse_time(ms: u64) -> TimeParts {
    let total = ms / 1000;
    TimeParts {
        days: total / 86_400,
        hours: (total % 86_400) / 3600,
        minutes: (total % 3600) / 60,
        seconds: total % 60,
    }
}

// Lector big-endian con el formato de DataInput de Java.
struct DataReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::InvalidTrack(format!(
                    "payload truncado: se pedían {} bytes en la posición {}",
                    len, self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // UTF-8 modificado de Java: lo que no es UTF-8 estándar se reemplaza.
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_nullable_utf(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            self.read_utf().map(Some)
        } else {
            Ok(None)
        }
    }
}
