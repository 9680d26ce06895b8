//! Method table.
//!
//! A request names one of a fixed set of methods. [`Method::parse`] reads the
//! name and that method's typed fields out of the runtime-native request once;
//! [`Method::invoke`] then performs exactly one call into the terminal module.
//! Field problems are reported before anything is called.

use crate::error::{BridgeError, RuntimeFault};
use crate::runtime::{Arg, RuntimeSession};
use crate::terminal::TerminalModule;

pub const SUPPORTED_METHODS: &[&str] = &[
    "terminal_info",
    "account_info",
    "version",
    "symbol_info",
    "symbol_info_tick",
    "get_m1_bars",
    "get_bars",
    "open_market_buy",
    "open_market_sell",
    "positions_get",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    pub fn parse(name: &str) -> Option<Self> {
        let tf = match name.to_ascii_uppercase().as_str() {
            "M1" => Timeframe::M1,
            "M5" => Timeframe::M5,
            "M15" => Timeframe::M15,
            "M30" => Timeframe::M30,
            "H1" => Timeframe::H1,
            "H4" => Timeframe::H4,
            "D1" => Timeframe::D1,
            "W1" => Timeframe::W1,
            "MN1" => Timeframe::MN1,
            _ => return None,
        };
        Some(tf)
    }

    /// Name of the module constant carrying the vendor's code for this timeframe.
    pub fn constant_name(self) -> &'static str {
        match self {
            Timeframe::M1 => "TIMEFRAME_M1",
            Timeframe::M5 => "TIMEFRAME_M5",
            Timeframe::M15 => "TIMEFRAME_M15",
            Timeframe::M30 => "TIMEFRAME_M30",
            Timeframe::H1 => "TIMEFRAME_H1",
            Timeframe::H4 => "TIMEFRAME_H4",
            Timeframe::D1 => "TIMEFRAME_D1",
            Timeframe::W1 => "TIMEFRAME_W1",
            Timeframe::MN1 => "TIMEFRAME_MN1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    fn constant_name(self) -> &'static str {
        match self {
            Side::Buy => "ORDER_TYPE_BUY",
            Side::Sell => "ORDER_TYPE_SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    TerminalInfo,
    AccountInfo,
    Version,
    SymbolInfo {
        symbol: String,
    },
    SymbolInfoTick {
        symbol: String,
    },
    /// The most recent `count` one-minute bars.
    GetM1Bars {
        symbol: String,
        count: i64,
    },
    GetBars {
        symbol: String,
        timeframe: Timeframe,
        start: i64,
        count: i64,
    },
    MarketOrder {
        side: Side,
        symbol: String,
        volume: f64,
    },
    PositionsGet {
        symbol: Option<String>,
    },
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::TerminalInfo => "terminal_info",
            Method::AccountInfo => "account_info",
            Method::Version => "version",
            Method::SymbolInfo { .. } => "symbol_info",
            Method::SymbolInfoTick { .. } => "symbol_info_tick",
            Method::GetM1Bars { .. } => "get_m1_bars",
            Method::GetBars { .. } => "get_bars",
            Method::MarketOrder {
                side: Side::Buy, ..
            } => "open_market_buy",
            Method::MarketOrder {
                side: Side::Sell, ..
            } => "open_market_sell",
            Method::PositionsGet { .. } => "positions_get",
        }
    }

    /// Read the method and its fields from a decoded request.
    pub fn parse<'s, S: RuntimeSession>(
        session: &'s S,
        request: &S::Object<'s>,
    ) -> Result<Method, BridgeError> {
        let name_obj = session
            .get_item(request, "method")
            .map_err(not_an_object)?
            .filter(|obj| !session.is_none(obj))
            .ok_or_else(|| BridgeError::MalformedRequest("missing method".into()))?;
        let name = session
            .extract_str(&name_obj)
            .map_err(|_| BridgeError::MalformedRequest("`method` must be a string".into()))?;

        let fields = Fields {
            session,
            request,
            method: &name,
        };

        let method = match name.as_str() {
            "terminal_info" => Method::TerminalInfo,
            "account_info" => Method::AccountInfo,
            "version" => Method::Version,
            "symbol_info" => Method::SymbolInfo {
                symbol: fields.string("symbol")?,
            },
            "symbol_info_tick" => Method::SymbolInfoTick {
                symbol: fields.string("symbol")?,
            },
            "get_m1_bars" => Method::GetM1Bars {
                symbol: fields.string("symbol")?,
                count: fields.count("count")?,
            },
            "get_bars" => Method::GetBars {
                symbol: fields.string("symbol")?,
                timeframe: fields.timeframe("timeframe")?,
                start: fields.start("start")?,
                count: fields.count("count")?,
            },
            "open_market_buy" => Method::MarketOrder {
                side: Side::Buy,
                symbol: fields.string("symbol")?,
                volume: fields.volume("volume")?,
            },
            "open_market_sell" => Method::MarketOrder {
                side: Side::Sell,
                symbol: fields.string("symbol")?,
                volume: fields.volume("volume")?,
            },
            "positions_get" => Method::PositionsGet {
                symbol: fields.optional_string("symbol")?,
            },
            other => return Err(BridgeError::UnknownMethod(other.to_string())),
        };
        Ok(method)
    }

    /// Perform this method's single call into the terminal module.
    pub fn invoke<'s, S: RuntimeSession + 's>(
        &self,
        terminal: &TerminalModule<'s, S>,
    ) -> Result<S::Object<'s>, BridgeError> {
        self.call(terminal).map_err(|fault| {
            BridgeError::ExternalCall(fault.describe_or(&format!("{} failed", self.name())))
        })
    }

    fn call<'s, S: RuntimeSession + 's>(
        &self,
        terminal: &TerminalModule<'s, S>,
    ) -> Result<S::Object<'s>, RuntimeFault> {
        match self {
            Method::TerminalInfo => terminal.call("terminal_info", &[], &[]),
            Method::AccountInfo => terminal.call("account_info", &[], &[]),
            Method::Version => terminal.call("version", &[], &[]),
            Method::SymbolInfo { symbol } => {
                terminal.call("symbol_info", &[Arg::Str(symbol)], &[])
            }
            Method::SymbolInfoTick { symbol } => {
                terminal.call("symbol_info_tick", &[Arg::Str(symbol)], &[])
            }
            Method::GetM1Bars { symbol, count } => {
                copy_rates(terminal, symbol, Timeframe::M1, 0, *count)
            }
            Method::GetBars {
                symbol,
                timeframe,
                start,
                count,
            } => copy_rates(terminal, symbol, *timeframe, *start, *count),
            Method::MarketOrder {
                side,
                symbol,
                volume,
            } => market_order(terminal, *side, symbol, *volume),
            Method::PositionsGet { symbol: None } => terminal.call("positions_get", &[], &[]),
            Method::PositionsGet {
                symbol: Some(symbol),
            } => terminal.call("positions_get", &[], &[("symbol", Arg::Str(symbol))]),
        }
    }
}

fn copy_rates<'s, S: RuntimeSession + 's>(
    terminal: &TerminalModule<'s, S>,
    symbol: &str,
    timeframe: Timeframe,
    start: i64,
    count: i64,
) -> Result<S::Object<'s>, RuntimeFault> {
    let tf = terminal.constant(timeframe.constant_name())?;
    terminal.call(
        "copy_rates_from_pos",
        &[Arg::Str(symbol), Arg::Object(&tf), Arg::Int(start), Arg::Int(count)],
        &[],
    )
}

/// Submit the smallest request the terminal accepts as an immediate deal.
fn market_order<'s, S: RuntimeSession + 's>(
    terminal: &TerminalModule<'s, S>,
    side: Side,
    symbol: &str,
    volume: f64,
) -> Result<S::Object<'s>, RuntimeFault> {
    let action = terminal.constant("TRADE_ACTION_DEAL")?;
    let order_type = terminal.constant(side.constant_name())?;
    let request = Arg::Dict(vec![
        ("action", Arg::Object(&action)),
        ("symbol", Arg::Str(symbol)),
        ("volume", Arg::Float(volume)),
        ("type", Arg::Object(&order_type)),
    ]);
    terminal.call("order_send", &[request], &[])
}

fn not_an_object(fault: RuntimeFault) -> BridgeError {
    BridgeError::MalformedRequest(fault.describe_or("request is not an object"))
}

struct Fields<'a, 's, S: RuntimeSession + 's> {
    session: &'s S,
    request: &'a S::Object<'s>,
    method: &'a str,
}

impl<'a, 's, S: RuntimeSession + 's> Fields<'a, 's, S> {
    /// The field's value; JSON null counts as absent.
    fn get(&self, field: &'static str) -> Result<Option<S::Object<'s>>, BridgeError> {
        let value = self
            .session
            .get_item(self.request, field)
            .map_err(not_an_object)?;
        Ok(value.filter(|obj| !self.session.is_none(obj)))
    }

    fn required(&self, field: &'static str) -> Result<S::Object<'s>, BridgeError> {
        self.get(field)?.ok_or_else(|| BridgeError::MissingField {
            method: self.method.to_string(),
            field,
        })
    }

    fn invalid(&self, field: &'static str, expected: &'static str) -> BridgeError {
        BridgeError::InvalidField {
            method: self.method.to_string(),
            field,
            expected,
        }
    }

    fn string(&self, field: &'static str) -> Result<String, BridgeError> {
        let obj = self.required(field)?;
        self.session
            .extract_str(&obj)
            .map_err(|_| self.invalid(field, "a string"))
    }

    fn optional_string(&self, field: &'static str) -> Result<Option<String>, BridgeError> {
        match self.get(field)? {
            Some(obj) => self
                .session
                .extract_str(&obj)
                .map(Some)
                .map_err(|_| self.invalid(field, "a string")),
            None => Ok(None),
        }
    }

    fn count(&self, field: &'static str) -> Result<i64, BridgeError> {
        let obj = self.required(field)?;
        match self.session.extract_i64(&obj) {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(self.invalid(field, "a positive integer")),
        }
    }

    /// Bar offset from the most recent one; defaults to 0.
    fn start(&self, field: &'static str) -> Result<i64, BridgeError> {
        match self.get(field)? {
            Some(obj) => match self.session.extract_i64(&obj) {
                Ok(n) if n >= 0 => Ok(n),
                _ => Err(self.invalid(field, "a non-negative integer")),
            },
            None => Ok(0),
        }
    }

    fn volume(&self, field: &'static str) -> Result<f64, BridgeError> {
        let obj = self.required(field)?;
        match self.session.extract_f64(&obj) {
            Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
            _ => Err(self.invalid(field, "a positive number")),
        }
    }

    fn timeframe(&self, field: &'static str) -> Result<Timeframe, BridgeError> {
        let name = self.string(field)?;
        Timeframe::parse(&name)
            .ok_or_else(|| self.invalid(field, "one of M1 M5 M15 M30 H1 H4 D1 W1 MN1"))
    }
}
