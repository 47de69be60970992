use std::fmt;

use crate::BusError;

/// Совокупная ошибка пачки конкурентных операций.
///
/// Хранит все ошибки без потерь; порядок соответствует порядку завершения
/// операций и не несёт смысла.
#[derive(Debug, Default)]
pub struct JoinedError {
    errors: Vec<BusError>,
}

impl JoinedError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавляет ошибку; вложенный `Joined` разворачивается.
    pub fn push(
        &mut self,
        err: BusError,
    ) {
        match err {
            BusError::Joined(nested) => self.errors.extend(nested.errors),
            other => self.errors.push(other),
        }
    }

    pub fn errors(&self) -> &[BusError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<BusError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl FromIterator<BusError> for JoinedError {
    fn from_iter<I: IntoIterator<Item = BusError>>(iter: I) -> Self {
        let mut joined = JoinedError::new();
        for err in iter {
            joined.push(err);
        }
        joined
    }
}

impl fmt::Display for JoinedError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no errors"),
            [single] => write!(f, "{single}"),
            many => {
                write!(f, "{} errors occurred: ", many.len())?;
                for (i, err) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for JoinedError {}
