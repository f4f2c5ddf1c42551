use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::result::Result as StdResult;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::defs::{Error, ErrorKind::*, Result};

/// Comma-separated list of values, e.g. `30,90,150`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct List<T>(pub Vec<T>);

impl<T: FromStr> FromStr for List<T> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed_err = || {
            let desc = format!("malformed value list '{}'", s);
            Error::new(MalformedData, desc)
        };

        if s.trim().is_empty() {
            return Ok(List(vec![]));
        }

        let mut vec = Vec::new();
        for part in s.split(',') {
            vec.push(part.trim().parse::<T>().map_err(|_| malformed_err())?);
        }

        Ok(List(vec))
    }
}

impl<T: Display> Display for List<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

impl<T> From<Vec<T>> for List<T> {
    fn from(vec: Vec<T>) -> Self {
        Self(vec)
    }
}

pub fn parse_key_val<T, U>(s: &str) -> StdResult<(T, U), Box<dyn StdError>>
where
    T: FromStr,
    T::Err: StdError + 'static,
    U: FromStr,
    U::Err: StdError + 'static,
{
    let err_func = || format!("malformed 'key=value' pair '{}'", s);
    let pos = s.find('=').ok_or_else(err_func)?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::path::PathBuf;

    #[test]
    fn test_list() {
        let list: List<f64> = "30, 90,150".parse().unwrap();
        assert_eq!(list.0, vec![30.0, 90.0, 150.0]);
        assert_eq!(list.to_string(), "30,90,150");

        let empty: List<usize> = "".parse().unwrap();
        assert!(empty.0.is_empty());

        assert!("1,x".parse::<List<usize>>().is_err());
    }

    #[test]
    fn test_parse_key_val() {
        let (k, v): (usize, PathBuf) = parse_key_val("3=/tmp/d.png").unwrap();
        assert_eq!(k, 3);
        assert_eq!(v, PathBuf::from("/tmp/d.png"));
        assert!(parse_key_val::<usize, PathBuf>("3").is_err());
    }
}
