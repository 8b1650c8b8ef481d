//! Addresses of application entities in a DICOM network.
//!
//! [`FullAeAddr`] and [`AeAddr`] couple an application entity (AE) title
//! with a network address,
//! written as `«ae_title»@«network_address»:«port»`.
//! The network address part may be an IPv4 or IPv6 address
//! or a domain name,
//! depending on the chosen type parameter.
use std::{
    convert::TryFrom,
    net::{SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
    str::FromStr,
};

use snafu::{ensure, AsErrorSource, ResultExt, Snafu};

/// The address of an application entity
/// in which the AE title is mandatory.
///
/// Values serialize to and parse from `{ae_title}@{address}`;
/// the address portion is handled by the type parameter `T`.
/// See [`AeAddr`] for the variant with an optional AE title.
///
/// # Example
///
/// ```
/// # use dicom_ulp::FullAeAddr;
/// # use std::net::SocketAddr;
/// #
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # // keep the address as text,
/// let addr: FullAeAddr<String> = "PACS-MAIN@10.2.7.41:11112".parse()?;
/// assert_eq!(addr.ae_title(), "PACS-MAIN");
/// assert_eq!(addr.socket_addr(), "10.2.7.41:11112");
/// # // or parse it into a proper socket address
/// let addr: FullAeAddr<SocketAddr> = "PACS-MAIN@10.2.7.41:11112".parse()?;
/// assert_eq!(addr.ae_title(), "PACS-MAIN");
/// assert_eq!(addr.socket_addr(), &SocketAddr::from(([10, 2, 7, 41], 11112)));
/// assert_eq!(&addr.to_string(), "PACS-MAIN@10.2.7.41:11112");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FullAeAddr<T> {
    ae_title: String,
    socket_addr: T,
}

impl<T> FullAeAddr<T> {
    /// Combine an AE title and a network address into a full address.
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    /// The AE title part.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The network address part.
    pub fn socket_addr(&self) -> &T {
        &self.socket_addr
    }

    /// Split the address back into its parts.
    pub fn into_parts(self) -> (String, T) {
        (self.ae_title, self.socket_addr)
    }
}

impl<T> From<(String, T)> for FullAeAddr<T> {
    fn from((ae_title, socket_addr): (String, T)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

/// An error parsing an AE address from text.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError<E>
where
    E: std::fmt::Debug + AsErrorSource,
{
    /// Missing `@` in full AE address
    MissingPart,

    /// Could not parse network socket address
    ParseSocketAddress { source: E },
}

impl<T> FromStr for FullAeAddr<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug + AsErrorSource,
{
    type Err = ParseAeAddressError<<T as FromStr>::Err>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // split at the first `@`; a literal `@` in an AE title
        // cannot currently be escaped
        match s.split_once('@') {
            Some((ae_title, addr)) => {
                ensure!(!ae_title.is_empty(), MissingPartSnafu);
                Ok(FullAeAddr {
                    ae_title: ae_title.to_string(),
                    socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
                })
            }
            None => Err(ParseAeAddressError::MissingPart),
        }
    }
}

impl<T> ToSocketAddrs for FullAeAddr<T>
where
    T: ToSocketAddrs,
{
    type Iter = T::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl<T> std::fmt::Display for FullAeAddr<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.ae_title.replace('@', "\\@"))?;
        f.write_str("@")?;
        std::fmt::Display::fmt(&self.socket_addr, f)
    }
}

/// The address of an application entity
/// in which the AE title is optional.
///
/// Values serialize to and parse from `{ae_title}@{address}`,
/// and a bare `{address}` parses with no AE title.
/// See [`FullAeAddr`] for the variant with a mandatory AE title.
///
/// # Example
///
/// ```
/// # use dicom_ulp::{AeAddr, FullAeAddr};
/// # use std::net::{SocketAddr, SocketAddrV4};
/// #
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr<SocketAddrV4> = "PACS-MAIN@10.2.7.41:11112".parse()?;
/// assert_eq!(addr.ae_title(), Some("PACS-MAIN"));
/// assert_eq!(addr.socket_addr(), &SocketAddrV4::new([10, 2, 7, 41].into(), 11112));
/// assert_eq!(&addr.to_string(), "PACS-MAIN@10.2.7.41:11112");
///
/// // the AE title may be absent
/// let addr: AeAddr<String> = "10.2.7.90:104".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// // and filled in afterwards
/// let full_addr: FullAeAddr<_> = addr.with_ae_title("MODALITY-WS");
/// assert_eq!(full_addr.ae_title(), "MODALITY-WS");
/// assert_eq!(&full_addr.to_string(), "MODALITY-WS@10.2.7.90:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AeAddr<T> {
    ae_title: Option<String>,
    socket_addr: T,
}

impl<T> AeAddr<T> {
    /// Combine an AE title and a network address.
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            socket_addr,
        }
    }

    /// Wrap a bare network address, with no AE title.
    pub fn new_socket_addr(socket_addr: T) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }

    /// The AE title part, when present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The network address part.
    pub fn socket_addr(&self) -> &T {
        &self.socket_addr
    }

    /// Force the given AE title onto this address,
    /// replacing any AE title already present.
    pub fn with_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr<T> {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr: self.socket_addr,
        }
    }

    /// Fill in the given AE title
    /// only where this address does not carry one.
    pub fn with_default_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr<T> {
        FullAeAddr {
            ae_title: self.ae_title.unwrap_or_else(|| ae_title.into()),
            socket_addr: self.socket_addr,
        }
    }

    /// Split the address back into its parts.
    pub fn into_parts(self) -> (Option<String>, T) {
        (self.ae_title, self.socket_addr)
    }
}

/// A socket address converts to an AE address with no AE title.
impl From<SocketAddr> for AeAddr<SocketAddr> {
    fn from(socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }
}

/// An IPv4 socket address converts to an AE address with no AE title.
impl From<SocketAddrV4> for AeAddr<SocketAddrV4> {
    fn from(socket_addr: SocketAddrV4) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }
}

/// An IPv6 socket address converts to an AE address with no AE title.
impl From<SocketAddrV6> for AeAddr<SocketAddrV6> {
    fn from(socket_addr: SocketAddrV6) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }
}

impl<T> From<FullAeAddr<T>> for AeAddr<T> {
    fn from(full: FullAeAddr<T>) -> Self {
        AeAddr {
            ae_title: Some(full.ae_title),
            socket_addr: full.socket_addr,
        }
    }
}

impl<T> FromStr for AeAddr<T>
where
    T: FromStr,
{
    type Err = <T as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // split at the first `@`; a literal `@` in an AE title
        // cannot currently be escaped
        match s.split_once('@') {
            Some((ae_title, address)) => Ok(AeAddr {
                ae_title: Some(ae_title)
                    .filter(|t| !t.is_empty())
                    .map(|t| t.to_string()),
                socket_addr: address.parse()?,
            }),
            None => Ok(AeAddr {
                ae_title: None,
                socket_addr: s.parse()?,
            }),
        }
    }
}

impl<'a> TryFrom<&'a str> for AeAddr<String> {
    type Error = <AeAddr<String> as FromStr>::Err;

    fn try_from(s: &'a str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl<T> ToSocketAddrs for AeAddr<T>
where
    T: ToSocketAddrs,
{
    type Iter = T::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl<T> std::fmt::Display for AeAddr<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let socket_addr = self.socket_addr.to_string();
        if let Some(ae_title) = &self.ae_title {
            f.write_str(&ae_title.replace('@', "\\@"))?;
            f.write_str("@")?;
        } else if socket_addr.contains('@') {
            // a leading `@` marks the whole remainder as a network address
            // when that address itself contains a `@`
            f.write_str("@")?;
        }

        std::fmt::Display::fmt(&socket_addr, f)
    }
}
