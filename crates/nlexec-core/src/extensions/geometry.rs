use super::{render_function, ExtensionHandler};
use crate::core_types::{CodeArtifact, DetectedValue, QueryAnalysis, QueryType, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Measure {
    Area,
    Perimeter,
    Volume,
    Surface,
}

impl Measure {
    fn as_str(&self) -> &'static str {
        match self {
            Measure::Area => "area",
            Measure::Perimeter => "perimeter",
            Measure::Volume => "volume",
            Measure::Surface => "surface_area",
        }
    }
}

// Checked in order; "pole powierzchni" must win over "pole".
const MEASURE_WORDS: &[(&str, Measure)] = &[
    ("surface", Measure::Surface),
    ("pole powierzchni", Measure::Surface),
    ("powierzchnia całkowita", Measure::Surface),
    ("volume", Measure::Volume),
    ("objętość", Measure::Volume),
    ("objętości", Measure::Volume),
    ("perimeter", Measure::Perimeter),
    ("circumference", Measure::Perimeter),
    ("obwód", Measure::Perimeter),
    ("obwodu", Measure::Perimeter),
    ("area", Measure::Area),
    ("pole", Measure::Area),
    ("pola", Measure::Area),
    ("powierzchni", Measure::Area),
];

fn requested_measure(query_text: &str, shape: Shape) -> Measure {
    let lowered = query_text.to_lowercase();
    let solid = matches!(shape, Shape::Sphere | Shape::Cube);
    let found = MEASURE_WORDS
        .iter()
        .find(|(word, _)| lowered.contains(word))
        .map(|(_, m)| *m);
    match (found, solid) {
        (Some(Measure::Surface), false) => Measure::Area,
        (Some(Measure::Area), true) => Measure::Surface,
        (Some(measure), _) => measure,
        (None, true) => Measure::Volume,
        (None, false) => Measure::Area,
    }
}

/// A formula ready to render: parameters, setup lines and result expression.
struct Formula {
    params: Vec<(String, DetectedValue)>,
    setup: Vec<String>,
    expression: String,
}

/// Area, perimeter, volume and surface formulas for common shapes.
///
/// The generated source uses `math.pi` without importing `math`; the import is
/// added by the dependency repair pass like for any other artifact.
pub struct GeometryHandler;

impl GeometryHandler {
    pub fn new() -> Self {
        Self
    }

    fn formula(&self, query_text: &str, analysis: &QueryAnalysis) -> Option<(Shape, Measure, Formula)> {
        if analysis.query_type != QueryType::Geometric {
            return None;
        }
        let shape = analysis.shape?;
        let measure = requested_measure(query_text, shape);
        let var = |name: &str| analysis.variable(name).map(|v| (name.to_string(), v));

        let formula = match shape {
            Shape::Circle | Shape::Sphere => {
                let (param, setup) = match var("radius") {
                    Some(radius) => (radius, Vec::new()),
                    None => (var("diameter")?, vec!["radius = diameter / 2".to_string()]),
                };
                let expression = match (shape, measure) {
                    (Shape::Circle, Measure::Area) => "math.pi * radius ** 2",
                    (Shape::Circle, Measure::Perimeter) => "2 * math.pi * radius",
                    (Shape::Sphere, Measure::Volume) => "4 / 3 * math.pi * radius ** 3",
                    (Shape::Sphere, Measure::Surface) => "4 * math.pi * radius ** 2",
                    _ => return None,
                };
                Formula {
                    params: vec![param],
                    setup,
                    expression: expression.to_string(),
                }
            }
            Shape::Square | Shape::Cube => {
                let side = var("side").or_else(|| var("length"))?;
                let name = side.0.clone();
                let expression = match (shape, measure) {
                    (Shape::Square, Measure::Area) => format!("{} ** 2", name),
                    (Shape::Square, Measure::Perimeter) => format!("4 * {}", name),
                    (Shape::Cube, Measure::Volume) => format!("{} ** 3", name),
                    (Shape::Cube, Measure::Surface) => format!("6 * {} ** 2", name),
                    _ => return None,
                };
                Formula {
                    params: vec![side],
                    setup: Vec::new(),
                    expression,
                }
            }
            Shape::Rectangle => {
                let sides: Vec<_> = ["width", "height", "length"]
                    .iter()
                    .filter_map(|name| var(name))
                    .take(2)
                    .collect();
                if sides.len() < 2 {
                    return None;
                }
                let (a, b) = (sides[0].0.clone(), sides[1].0.clone());
                let expression = match measure {
                    Measure::Area => format!("{} * {}", a, b),
                    Measure::Perimeter => format!("2 * ({} + {})", a, b),
                    _ => return None,
                };
                Formula {
                    params: sides,
                    setup: Vec::new(),
                    expression,
                }
            }
            Shape::Triangle => {
                if measure != Measure::Area {
                    return None;
                }
                let base = var("base").or_else(|| var("length"))?;
                let height = var("height")?;
                let expression = format!("{} * {} / 2", base.0, height.0);
                Formula {
                    params: vec![base, height],
                    setup: Vec::new(),
                    expression,
                }
            }
        };
        Some((shape, measure, formula))
    }
}

impl Default for GeometryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionHandler for GeometryHandler {
    fn name(&self) -> &str {
        "geometry"
    }

    fn matches(&self, query_text: &str, analysis: &QueryAnalysis) -> bool {
        self.formula(query_text, analysis).is_some()
    }

    fn generate(&self, query_text: &str, analysis: &QueryAnalysis) -> CodeArtifact {
        let Some((shape, measure, formula)) = self.formula(query_text, analysis) else {
            log::warn!("Geometry handler invoked for a query it does not match");
            return render_function(self.name(), "solution", "Unsupported geometry query.", &[], &[
                "return None".to_string(),
            ]);
        };
        let mut body = formula.setup;
        body.push(format!("return {}", formula.expression));
        render_function(
            self.name(),
            &format!("{}_{}", shape, measure.as_str()),
            &format!("Geometric: {} of a {}.", measure.as_str().replace('_', " "), shape),
            &formula.params,
            &body,
        )
    }
}
