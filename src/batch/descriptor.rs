//! Parser for the XML batch descriptor.
//!
//! ```xml
//! <ExperimentBatch>
//!   <Experiment Name="swing-up" Executable="bin/simulate" Arguments="-quiet">
//!     <Input Path="data/pendulum.xml"/>
//!     <ExperimentalUnit Name="swing-up-0" Path="swing-up/unit-0.simion.exp">
//!       <Fork Name="gamma" Value="0.9"/>
//!     </ExperimentalUnit>
//!   </Experiment>
//! </ExperimentBatch>
//! ```

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::batch::unit::ForkValue;

pub const BATCH_TAG: &str = "ExperimentBatch";
pub const EXPERIMENT_TAG: &str = "Experiment";
pub const UNIT_TAG: &str = "ExperimentalUnit";
pub const INPUT_TAG: &str = "Input";
pub const FORK_TAG: &str = "Fork";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEntry {
    pub name: Option<String>,
    pub path: String,
    pub forks: Vec<ForkValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentEntry {
    pub name: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub inputs: Vec<String>,
    pub units: Vec<UnitEntry>,
}

/// Parse descriptor text into experiment entries, in document order.
pub fn parse(xml: &str) -> Result<Vec<ExperimentEntry>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_root = false;
    let mut experiments = Vec::new();
    let mut experiment: Option<ExperimentEntry> = None;
    let mut unit: Option<UnitEntry> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = element_name(e);
                if !saw_root {
                    if name != BATCH_TAG {
                        return Err(format!(
                            "root element is <{}>, expected <{}>",
                            name, BATCH_TAG
                        ));
                    }
                    saw_root = true;
                    if is_empty {
                        break;
                    }
                    continue;
                }
                match name.as_str() {
                    EXPERIMENT_TAG if experiment.is_none() => {
                        let entry = ExperimentEntry {
                            name: attribute(e, "Name")?
                                .unwrap_or_else(|| format!("experiment-{}", experiments.len())),
                            executable: required_attribute(e, "Executable")?,
                            arguments: attribute(e, "Arguments")?
                                .map(|a| a.split_whitespace().map(str::to_string).collect())
                                .unwrap_or_default(),
                            inputs: Vec::new(),
                            units: Vec::new(),
                        };
                        if is_empty {
                            experiments.push(entry);
                        } else {
                            experiment = Some(entry);
                        }
                    }
                    INPUT_TAG if unit.is_none() => {
                        if let Some(exp) = experiment.as_mut() {
                            exp.inputs.push(required_attribute(e, "Path")?);
                        }
                    }
                    UNIT_TAG if experiment.is_some() && unit.is_none() => {
                        let entry = UnitEntry {
                            name: attribute(e, "Name")?,
                            path: required_attribute(e, "Path")?,
                            forks: Vec::new(),
                        };
                        match (is_empty, experiment.as_mut()) {
                            (true, Some(exp)) => exp.units.push(entry),
                            _ => unit = Some(entry),
                        }
                    }
                    FORK_TAG => {
                        if let Some(u) = unit.as_mut() {
                            u.forks.push(ForkValue {
                                name: required_attribute(e, "Name")?,
                                value: attribute(e, "Value")?.unwrap_or_default(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    UNIT_TAG => {
                        if let (Some(u), Some(exp)) = (unit.take(), experiment.as_mut()) {
                            exp.units.push(u);
                        }
                    }
                    EXPERIMENT_TAG => {
                        if let Some(exp) = experiment.take() {
                            experiments.push(exp);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(format!("missing <{}> root element", BATCH_TAG));
    }
    Ok(experiments)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, String> {
    match e.try_get_attribute(key).map_err(|err| err.to_string())? {
        Some(attr) => Ok(Some(
            attr.unescape_value()
                .map_err(|err| err.to_string())?
                .into_owned(),
        )),
        None => Ok(None),
    }
}

fn required_attribute(e: &BytesStart<'_>, key: &str) -> Result<String, String> {
    attribute(e, key)?
        .ok_or_else(|| format!("<{}> is missing attribute {}", element_name(e), key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_experiments_units_and_forks() {
        let xml = r#"
            <ExperimentBatch>
              <Experiment Name="a" Executable="bin/sim" Arguments="-x  -y">
                <Input Path="data/in.txt"/>
                <ExperimentalUnit Name="a-0" Path="a/u0.simion.exp">
                  <Fork Name="gamma" Value="0.9"/>
                  <Fork Name="alpha" Value="0.1"/>
                </ExperimentalUnit>
                <ExperimentalUnit Path="a/u1.simion.exp"/>
              </Experiment>
              <Experiment Name="b" Executable="/bin/sh"/>
            </ExperimentBatch>"#;
        let experiments = parse(xml).unwrap();
        assert_eq!(experiments.len(), 2);

        let a = &experiments[0];
        assert_eq!(a.name, "a");
        assert_eq!(a.executable, "bin/sim");
        assert_eq!(a.arguments, vec!["-x", "-y"]);
        assert_eq!(a.inputs, vec!["data/in.txt"]);
        assert_eq!(a.units.len(), 2);
        assert_eq!(a.units[0].name.as_deref(), Some("a-0"));
        assert_eq!(a.units[0].forks.len(), 2);
        assert_eq!(a.units[0].forks[1].name, "alpha");
        assert_eq!(a.units[1].path, "a/u1.simion.exp");
        assert!(a.units[1].name.is_none());

        assert!(experiments[1].units.is_empty());
    }

    #[test]
    fn unknown_elements_are_ignored() {
        let xml = r#"<ExperimentBatch><Comment>hi</Comment>
            <Experiment Name="a" Executable="sh"><Notes/><ExperimentalUnit Path="u"/></Experiment>
            </ExperimentBatch>"#;
        let experiments = parse(xml).unwrap();
        assert_eq!(experiments[0].units.len(), 1);
    }

    #[test]
    fn wrong_root_is_rejected() {
        assert!(parse("<Batch></Batch>").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn unit_without_path_is_rejected() {
        let xml = r#"<ExperimentBatch><Experiment Executable="sh">
            <ExperimentalUnit Name="x"/></Experiment></ExperimentBatch>"#;
        let err = parse(xml).unwrap_err();
        assert!(err.contains("Path"), "{}", err);
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(parse("<ExperimentBatch><Experiment Executable=sh></ExperimentBatch>").is_err());
    }
}
