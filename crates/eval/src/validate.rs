//! Static checks run before a definition is handed to a controller.
//!
//! Every expression is asked for the shape it produces given its children's
//! shapes; variable references are resolved against the declarations in
//! scope. Findings go into a [`ValidationReport`]. Error-level findings make
//! the controllers refuse the definition.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::EngineError;
use crate::evaluate::anchored_regex;
use crate::expression::{Expression, FloatOrVariable, IntOrVariable, MathFunction, ToleranceMode};
use crate::extension::ExtensionRegistry;
use crate::notification::{Notification, ValidationReport};
use crate::rules::{ProcessingPhase, ProcessingRule};
use crate::types::{
    builtin_signature, AssessmentItem, AssessmentItemRef, AssessmentSection, AssessmentTest,
    BaseType, BranchRule, BranchTarget, Cardinality, Identifier, SectionPart, Signature,
    VariableDeclaration, VariableKind, VariableRef, COMPLETION_STATUS, DURATION,
};

// ──────────────────────────────────────────────
// Item resolution
// ──────────────────────────────────────────────

/// Outcome of resolving one item reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemLookup {
    Resolved(AssessmentItem),
    Failed { href: String, reason: String },
}

/// Supplies the item definition behind each `assessmentItemRef`.
pub trait ItemResolver {
    fn resolve(&self, item_ref: &AssessmentItemRef) -> ItemLookup;
}

/// Items keyed by `href`.
impl ItemResolver for BTreeMap<String, AssessmentItem> {
    fn resolve(&self, item_ref: &AssessmentItemRef) -> ItemLookup {
        match self.get(&item_ref.href) {
            Some(item) => ItemLookup::Resolved(item.clone()),
            None => ItemLookup::Failed {
                href: item_ref.href.clone(),
                reason: "no item with this href".to_string(),
            },
        }
    }
}

// ──────────────────────────────────────────────
// Resolved definitions
// ──────────────────────────────────────────────

/// An item definition together with its validation findings.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    item: Arc<AssessmentItem>,
    report: ValidationReport,
}

impl ResolvedItem {
    pub fn new(item: AssessmentItem, extensions: &ExtensionRegistry) -> Self {
        Self::from_arc(Arc::new(item), extensions)
    }

    pub fn from_arc(item: Arc<AssessmentItem>, extensions: &ExtensionRegistry) -> Self {
        let report = validate_item(&item, extensions);
        tracing::debug!(
            item = %item.identifier,
            findings = report.findings.len(),
            "validated item"
        );
        ResolvedItem { item, report }
    }

    pub fn item(&self) -> &AssessmentItem {
        &self.item
    }

    pub fn shared(&self) -> Arc<AssessmentItem> {
        Arc::clone(&self.item)
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    /// Fails with [`EngineError::InvalidDefinition`] if any finding is an error.
    pub fn ensure_valid(&self) -> Result<(), EngineError> {
        ensure_valid(self.item.identifier.as_str(), &self.report)
    }
}

/// A test definition with every item reference resolved.
#[derive(Debug, Clone)]
pub struct ResolvedTest {
    test: Arc<AssessmentTest>,
    items: BTreeMap<Identifier, Arc<AssessmentItem>>,
    report: ValidationReport,
}

impl ResolvedTest {
    pub fn resolve(
        test: AssessmentTest,
        resolver: &dyn ItemResolver,
        extensions: &ExtensionRegistry,
    ) -> Self {
        let mut report = ValidationReport::new();
        let mut items = BTreeMap::new();
        for item_ref in test.item_refs() {
            match resolver.resolve(item_ref) {
                ItemLookup::Resolved(item) => {
                    let item_report = validate_item(&item, extensions);
                    for finding in item_report.findings {
                        report.push(Notification::new(
                            finding.level,
                            format!("itemRef '{}' > {}", item_ref.identifier, finding.node),
                            finding.message,
                        ));
                    }
                    items.insert(item_ref.identifier.clone(), Arc::new(item));
                }
                ItemLookup::Failed { href, reason } => {
                    tracing::warn!(item_ref = %item_ref.identifier, %href, %reason, "item resolution failed");
                    report.error(
                        format!("itemRef '{}'", item_ref.identifier),
                        format!("cannot resolve '{}': {}", href, reason),
                    );
                }
            }
        }
        validate_test(&test, &items, extensions, &mut report);
        tracing::debug!(
            test = %test.identifier,
            items = items.len(),
            findings = report.findings.len(),
            "resolved test"
        );
        ResolvedTest {
            test: Arc::new(test),
            items,
            report,
        }
    }

    pub fn test(&self) -> &AssessmentTest {
        &self.test
    }

    /// Item behind the itemRef `identifier`.
    pub fn item(&self, item_ref: &str) -> Option<&AssessmentItem> {
        self.items.get(item_ref).map(|i| i.as_ref())
    }

    pub fn items(&self) -> &BTreeMap<Identifier, Arc<AssessmentItem>> {
        &self.items
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn ensure_valid(&self) -> Result<(), EngineError> {
        ensure_valid(self.test.identifier.as_str(), &self.report)
    }
}

fn ensure_valid(subject: &str, report: &ValidationReport) -> Result<(), EngineError> {
    if report.has_errors() {
        return Err(EngineError::InvalidDefinition {
            subject: subject.to_string(),
            findings: report.errors().cloned().collect(),
        });
    }
    Ok(())
}

// ──────────────────────────────────────────────
// Shapes
// ──────────────────────────────────────────────

/// Statically known part of a value's signature; `None` means "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shape {
    cardinality: Option<Cardinality>,
    base_type: Option<BaseType>,
}

impl Shape {
    const ANY: Shape = Shape {
        cardinality: None,
        base_type: None,
    };

    fn single(base_type: BaseType) -> Self {
        Shape {
            cardinality: Some(Cardinality::Single),
            base_type: Some(base_type),
        }
    }

    fn of(signature: Signature) -> Self {
        Shape {
            cardinality: Some(signature.cardinality),
            base_type: signature.base_type,
        }
    }

    fn with_cardinality(self, cardinality: Cardinality) -> Self {
        Shape {
            cardinality: Some(cardinality),
            ..self
        }
    }
}

fn base_list(types: &[BaseType]) -> String {
    types
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join("/")
}

const NUMERIC: &[BaseType] = &[BaseType::Integer, BaseType::Float];
const SINGLE: &[Cardinality] = &[Cardinality::Single];
const CONTAINER: &[Cardinality] = &[Cardinality::Multiple, Cardinality::Ordered];
const NOT_RECORD: &[Cardinality] = &[
    Cardinality::Single,
    Cardinality::Multiple,
    Cardinality::Ordered,
];

/// Whether a value of `shape` may be written to a variable of `target`.
fn assignable(target: Signature, shape: Shape) -> bool {
    if let Some(c) = shape.cardinality {
        if c != target.cardinality {
            return false;
        }
    }
    match (target.base_type, shape.base_type) {
        (Some(t), Some(s)) => t == s || (t == BaseType::Float && s == BaseType::Integer),
        _ => true,
    }
}

// ──────────────────────────────────────────────
// Declaration environments
// ──────────────────────────────────────────────

trait Env {
    fn resolve(&self, reference: &VariableRef) -> Result<Signature, String>;
    fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration>;
    fn in_test(&self) -> bool;
}

struct ItemEnv<'a> {
    item: &'a AssessmentItem,
}

impl Env for ItemEnv<'_> {
    fn resolve(&self, reference: &VariableRef) -> Result<Signature, String> {
        if reference.is_dotted() {
            return Err(format!(
                "'{}' refers to another item; only tests may do that",
                reference
            ));
        }
        item_signature(self.item, reference.variable.as_str())
            .ok_or_else(|| format!("'{}' is not declared", reference))
    }

    fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration> {
        self.item.declaration(identifier)
    }

    fn in_test(&self) -> bool {
        false
    }
}

fn item_signature(item: &AssessmentItem, name: &str) -> Option<Signature> {
    builtin_signature(name).or_else(|| item.declaration(name).map(|d| d.signature()))
}

struct TestEnv<'a> {
    test: &'a AssessmentTest,
    items: &'a BTreeMap<Identifier, Arc<AssessmentItem>>,
}

impl Env for TestEnv<'_> {
    fn resolve(&self, reference: &VariableRef) -> Result<Signature, String> {
        let Some(item_ref) = &reference.item_ref else {
            let name = reference.variable.as_str();
            if name == DURATION {
                return Ok(Signature::single(BaseType::Float));
            }
            return self
                .test
                .declaration(name)
                .map(|d| d.signature())
                .ok_or_else(|| format!("'{}' is not declared by the test", reference));
        };
        let Some(item) = self.items.get(item_ref) else {
            return Err(format!("'{}' names an unknown itemRef '{}'", reference, item_ref));
        };
        item_signature(item, reference.variable.as_str()).ok_or_else(|| {
            format!(
                "item '{}' does not declare '{}'",
                item.identifier, reference.variable
            )
        })
    }

    fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration> {
        self.test.declaration(identifier)
    }

    fn in_test(&self) -> bool {
        true
    }
}

// ──────────────────────────────────────────────
// Checker
// ──────────────────────────────────────────────

struct Checker<'a> {
    env: &'a dyn Env,
    extensions: &'a ExtensionRegistry,
    report: &'a mut ValidationReport,
    subject: String,
}

impl<'a> Checker<'a> {
    fn new(
        env: &'a dyn Env,
        extensions: &'a ExtensionRegistry,
        report: &'a mut ValidationReport,
        subject: impl Into<String>,
    ) -> Self {
        Checker {
            env,
            extensions,
            report,
            subject: subject.into(),
        }
    }

    fn node(&self, name: &str) -> String {
        format!("{} > {}", self.subject, name)
    }

    fn error(&mut self, name: &str, message: impl Into<String>) {
        let node = self.node(name);
        self.report.error(node, message);
    }

    fn warning(&mut self, name: &str, message: impl Into<String>) {
        let node = self.node(name);
        self.report.warning(node, message);
    }

    fn expect(
        &mut self,
        expr: &Expression,
        shape: Shape,
        cardinalities: &[Cardinality],
        base_types: Option<&[BaseType]>,
    ) {
        if let Some(c) = shape.cardinality {
            if !cardinalities.contains(&c) {
                self.error(
                    expr.name(),
                    format!("operand has cardinality {}", c.name()),
                );
            }
        }
        if let (Some(allowed), Some(bt)) = (base_types, shape.base_type) {
            if !allowed.contains(&bt) {
                self.error(
                    expr.name(),
                    format!("operand has base type {}, expected {}", bt, base_list(allowed)),
                );
            }
        }
    }

    fn check_int_ref(&mut self, expr: &Expression, value: &IntOrVariable) {
        if let IntOrVariable::Variable(id) = value {
            self.check_template_ref(expr, id, BaseType::Integer);
        }
    }

    fn check_template_ref(&mut self, expr: &Expression, id: &Identifier, base_type: BaseType) {
        match self.env.resolve(&VariableRef::local(id.clone())) {
            Ok(sig) if sig == Signature::single(base_type) => {}
            Ok(sig) => self.error(
                expr.name(),
                format!("'{}' is {}, expected single {}", id, sig, base_type),
            ),
            Err(message) => self.error(expr.name(), message),
        }
    }

    /// Checks `expr` and returns the shape it produces.
    fn expression(&mut self, expr: &Expression) -> Shape {
        use Expression as E;
        let children: Vec<Shape> = expr
            .children()
            .into_iter()
            .map(|c| self.expression(c))
            .collect();

        if expr.is_test_only() && !self.env.in_test() {
            self.error(expr.name(), "only available in test outcome processing");
        }

        match expr {
            E::BaseValue(v) => Shape::single(v.base_type()),
            E::Variable { identifier, .. } => match self.env.resolve(identifier) {
                Ok(sig) => Shape::of(sig),
                Err(message) => {
                    self.error(expr.name(), message);
                    Shape::ANY
                }
            },
            E::Default { identifier } => match self.env.declaration(identifier.as_str()) {
                Some(d) => Shape::of(d.signature()),
                None => {
                    self.error(expr.name(), format!("'{}' is not declared", identifier));
                    Shape::ANY
                }
            },
            E::Correct { identifier } => match self.env.declaration(identifier.as_str()) {
                Some(d) if d.kind == VariableKind::Response => Shape::of(d.signature()),
                _ => {
                    self.error(
                        expr.name(),
                        format!("'{}' is not a response variable", identifier),
                    );
                    Shape::ANY
                }
            },
            E::MapResponse { identifier } => {
                let ok = self
                    .env
                    .declaration(identifier.as_str())
                    .is_some_and(|d| d.kind == VariableKind::Response && d.mapping().is_some());
                if !ok {
                    self.error(
                        expr.name(),
                        format!("'{}' is not a response variable with a mapping", identifier),
                    );
                }
                Shape::single(BaseType::Float)
            }
            E::MapResponsePoint { identifier } => {
                let ok = self.env.declaration(identifier.as_str()).is_some_and(|d| {
                    d.kind == VariableKind::Response
                        && d.area_mapping().is_some()
                        && d.base_type == Some(BaseType::Point)
                });
                if !ok {
                    self.error(
                        expr.name(),
                        format!(
                            "'{}' is not a point response variable with an area mapping",
                            identifier
                        ),
                    );
                }
                Shape::single(BaseType::Float)
            }
            E::Null => Shape::ANY,
            E::RandomInteger { min, max, step } => {
                self.check_int_ref(expr, min);
                self.check_int_ref(expr, max);
                self.check_int_ref(expr, step);
                if let (IntOrVariable::Int(a), IntOrVariable::Int(b)) = (min, max) {
                    if a > b {
                        self.error(expr.name(), format!("min {} exceeds max {}", a, b));
                    }
                }
                Shape::single(BaseType::Integer)
            }
            E::RandomFloat { min, max } => {
                for bound in [min, max] {
                    if let FloatOrVariable::Variable(id) = bound {
                        self.check_template_ref(expr, id, BaseType::Float);
                    }
                }
                Shape::single(BaseType::Float)
            }
            E::MathConstant(_) => Shape::single(BaseType::Float),

            E::NumberCorrect(_)
            | E::NumberIncorrect(_)
            | E::NumberPresented(_)
            | E::NumberResponded(_)
            | E::NumberSelected(_) => Shape::single(BaseType::Integer),
            E::OutcomeMaximum { .. } | E::OutcomeMinimum { .. } => Shape {
                cardinality: Some(Cardinality::Multiple),
                base_type: Some(BaseType::Float),
            },
            E::TestVariables { base_type, .. } => Shape {
                cardinality: Some(Cardinality::Multiple),
                base_type: match base_type {
                    Some(BaseType::Integer) => Some(BaseType::Integer),
                    Some(BaseType::Float) => Some(BaseType::Float),
                    Some(other) => {
                        self.error(
                            expr.name(),
                            format!("cannot aggregate {} variables", other),
                        );
                        None
                    }
                    None => None,
                },
            },

            E::Multiple(_) | E::Ordered(_) => {
                let cardinality = if matches!(expr, E::Multiple(_)) {
                    Cardinality::Multiple
                } else {
                    Cardinality::Ordered
                };
                let mut base_type = None;
                for shape in &children {
                    self.expect(expr, *shape, &[Cardinality::Single, cardinality], None);
                    match (base_type, shape.base_type) {
                        (None, b) => base_type = b,
                        (Some(a), Some(b)) if a != b => {
                            self.warning(
                                expr.name(),
                                format!("mixes base types {} and {}", a, b),
                            );
                        }
                        _ => {}
                    }
                }
                Shape {
                    cardinality: Some(cardinality),
                    base_type,
                }
            }
            E::ContainerSize(_) => {
                self.expect(expr, children[0], CONTAINER, None);
                Shape::single(BaseType::Integer)
            }
            E::IsNull(_) => Shape::single(BaseType::Boolean),
            E::Index { n, .. } => {
                self.check_int_ref(expr, n);
                if let IntOrVariable::Int(i) = n {
                    if *i < 1 {
                        self.error(expr.name(), format!("index {} is not positive", i));
                    }
                }
                self.expect(expr, children[0], &[Cardinality::Ordered], None);
                children[0].with_cardinality(Cardinality::Single)
            }
            E::FieldValue { .. } => {
                self.expect(expr, children[0], &[Cardinality::Record], None);
                Shape {
                    cardinality: Some(Cardinality::Single),
                    base_type: None,
                }
            }
            E::Random(_) => {
                self.expect(expr, children[0], CONTAINER, None);
                children[0].with_cardinality(Cardinality::Single)
            }
            E::Member(_) | E::Delete(_) | E::Contains(_) => {
                let (a, b) = (children[0], children[1]);
                if matches!(expr, E::Contains(_)) {
                    self.expect(expr, a, CONTAINER, None);
                    self.expect(expr, b, CONTAINER, None);
                    if let (Some(x), Some(y)) = (a.cardinality, b.cardinality) {
                        if x != y {
                            self.error(expr.name(), "operands differ in cardinality");
                        }
                    }
                } else {
                    self.expect(expr, a, SINGLE, None);
                    self.expect(expr, b, CONTAINER, None);
                }
                if let (Some(x), Some(y)) = (a.base_type, b.base_type) {
                    if x != y {
                        self.error(
                            expr.name(),
                            format!("operands differ in base type ({} vs {})", x, y),
                        );
                    }
                }
                if matches!(expr, E::Delete(_)) {
                    b
                } else {
                    Shape::single(BaseType::Boolean)
                }
            }
            E::Repeat { number_repeats, .. } => {
                self.check_int_ref(expr, number_repeats);
                let mut base_type = None;
                for shape in &children {
                    self.expect(expr, *shape, &[Cardinality::Single, Cardinality::Ordered], None);
                    base_type = base_type.or(shape.base_type);
                }
                Shape {
                    cardinality: Some(Cardinality::Ordered),
                    base_type,
                }
            }

            E::Not(_) | E::And(_) | E::Or(_) | E::AnyN { .. } => {
                if let E::AnyN { min, max, .. } = expr {
                    self.check_int_ref(expr, min);
                    self.check_int_ref(expr, max);
                }
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(&[BaseType::Boolean]));
                }
                Shape::single(BaseType::Boolean)
            }
            E::Match(_) => {
                let (a, b) = (children[0], children[1]);
                for side in [a, b] {
                    if side.cardinality == Some(Cardinality::Record) {
                        self.error(expr.name(), "records cannot be matched");
                    }
                    if side.base_type == Some(BaseType::Duration) {
                        self.error(expr.name(), "durations cannot be matched");
                    }
                }
                let cardinality_differs =
                    matches!((a.cardinality, b.cardinality), (Some(p), Some(q)) if p != q);
                let base_differs =
                    matches!((a.base_type, b.base_type), (Some(p), Some(q)) if p != q);
                if cardinality_differs || base_differs {
                    self.error(expr.name(), "operands have different signatures");
                }
                Shape::single(BaseType::Boolean)
            }
            E::Equal { .. }
            | E::EqualRounded { .. }
            | E::Lt(_)
            | E::Gt(_)
            | E::Lte(_)
            | E::Gte(_) => {
                if let E::EqualRounded { figures, .. } = expr {
                    self.check_int_ref(expr, figures);
                }
                if let E::Equal {
                    tolerance_mode,
                    tolerance,
                    ..
                } = expr
                {
                    if *tolerance_mode != ToleranceMode::Exact
                        && tolerance.is_empty()
                    {
                        self.error(expr.name(), "tolerance mode requires a tolerance");
                    }
                }
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(NUMERIC));
                }
                Shape::single(BaseType::Boolean)
            }
            E::DurationLt(_) | E::DurationGte(_) => {
                for shape in &children {
                    self.expect(
                        expr,
                        *shape,
                        SINGLE,
                        Some(&[BaseType::Duration, BaseType::Float]),
                    );
                }
                Shape::single(BaseType::Boolean)
            }
            E::Inside { .. } => {
                self.expect(expr, children[0], NOT_RECORD, Some(&[BaseType::Point]));
                Shape::single(BaseType::Boolean)
            }

            E::Substring { .. } | E::StringMatch { .. } | E::PatternMatch { .. } => {
                if let E::PatternMatch { pattern, .. } = expr {
                    if let Err(e) = anchored_regex(pattern) {
                        self.error(expr.name(), e.to_string());
                    }
                }
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(&[BaseType::String]));
                }
                Shape::single(BaseType::Boolean)
            }

            E::Sum(_) | E::Product(_) | E::Max(_) | E::Min(_) => {
                for shape in &children {
                    self.expect(expr, *shape, NOT_RECORD, Some(NUMERIC));
                }
                numeric_result(&children)
            }
            E::Subtract(_) => {
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(NUMERIC));
                }
                numeric_result(&children)
            }
            E::Divide(_) | E::Power(_) => {
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(NUMERIC));
                }
                Shape::single(BaseType::Float)
            }
            E::IntegerDivide(_) | E::IntegerModulus(_) => {
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(&[BaseType::Integer]));
                }
                Shape::single(BaseType::Integer)
            }
            E::Truncate(_) | E::Round(_) => {
                self.expect(expr, children[0], SINGLE, Some(NUMERIC));
                Shape::single(BaseType::Integer)
            }
            E::RoundTo { figures, .. } => {
                self.check_int_ref(expr, figures);
                self.expect(expr, children[0], SINGLE, Some(NUMERIC));
                Shape::single(BaseType::Float)
            }
            E::IntegerToFloat(_) => {
                self.expect(expr, children[0], SINGLE, Some(&[BaseType::Integer]));
                Shape::single(BaseType::Float)
            }
            E::Gcd(_) | E::Lcm(_) => {
                for shape in &children {
                    self.expect(expr, *shape, NOT_RECORD, Some(&[BaseType::Integer]));
                }
                Shape::single(BaseType::Integer)
            }
            E::StatsOperator { .. } => {
                self.expect(expr, children[0], CONTAINER, Some(NUMERIC));
                Shape::single(BaseType::Float)
            }
            E::MathOperator { name, .. } => {
                if children.len() != name.arity() {
                    self.error(
                        expr.name(),
                        format!(
                            "expects {} operand(s), got {}",
                            name.arity(),
                            children.len()
                        ),
                    );
                }
                for shape in &children {
                    self.expect(expr, *shape, SINGLE, Some(NUMERIC));
                }
                match name {
                    MathFunction::Floor | MathFunction::Ceil | MathFunction::Signum => {
                        Shape::single(BaseType::Integer)
                    }
                    MathFunction::Abs => children.first().copied().unwrap_or(Shape::ANY),
                    _ => Shape::single(BaseType::Float),
                }
            }
            E::CustomOperator { class, .. } => match self.extensions.operator(class) {
                Some(op) => op.signature().map_or(Shape::ANY, Shape::of),
                None => {
                    self.error(
                        expr.name(),
                        format!("no custom operator registered for '{}'", class),
                    );
                    Shape::ANY
                }
            },
        }
    }

    fn rules(&mut self, rules: &[ProcessingRule], phase: ProcessingPhase) {
        for rule in rules {
            self.rule(rule, phase);
        }
    }

    fn rule(&mut self, rule: &ProcessingRule, phase: ProcessingPhase) {
        if !phase.allows(rule) {
            self.error(rule.name(), format!("not allowed in {}", phase));
        }
        let shapes: Vec<Shape> = rule
            .expressions()
            .into_iter()
            .map(|e| self.expression(e))
            .collect();
        match rule {
            ProcessingRule::Condition { .. } => {
                for shape in &shapes {
                    self.check_guard(rule, *shape);
                }
            }
            ProcessingRule::TemplateConstraint(_) => self.check_guard(rule, shapes[0]),
            ProcessingRule::Custom { class, .. } => {
                if self.extensions.rule(class).is_none() {
                    self.error(
                        rule.name(),
                        format!("no custom rule registered for '{}'", class),
                    );
                }
            }
            _ => {}
        }
        if let Some(target) = rule.target() {
            self.check_target(rule, target, shapes[0], phase);
        }
        for list in rule.nested() {
            self.rules(list, phase);
        }
    }

    fn check_guard(&mut self, rule: &ProcessingRule, shape: Shape) {
        if !assignable(Signature::single(BaseType::Boolean), shape) {
            self.error(rule.name(), "condition must be a single boolean");
        }
    }

    fn check_target(
        &mut self,
        rule: &ProcessingRule,
        target: &Identifier,
        shape: Shape,
        phase: ProcessingPhase,
    ) {
        let name = target.as_str();
        if name == COMPLETION_STATUS && !self.env.in_test() {
            if !matches!(rule, ProcessingRule::SetValue { .. }) {
                self.error(rule.name(), "completionStatus can only be set");
            }
            return;
        }
        let Some(declaration) = self.env.declaration(name) else {
            self.error(rule.name(), format!("'{}' is not declared", target));
            return;
        };
        let writable = match rule {
            ProcessingRule::SetDefaultValue { .. } => true,
            ProcessingRule::SetCorrectResponse { .. } => {
                declaration.kind == VariableKind::Response
            }
            _ => match phase {
                ProcessingPhase::Template => declaration.kind == VariableKind::Template,
                ProcessingPhase::Response | ProcessingPhase::Outcome => {
                    declaration.kind == VariableKind::Outcome
                }
            },
        };
        if !writable {
            self.error(
                rule.name(),
                format!(
                    "{} variable '{}' is not writable in {}",
                    declaration.kind, target, phase
                ),
            );
        }
        if let ProcessingRule::LookupOutcomeValue { .. } = rule {
            if declaration.lookup_table().is_none() {
                self.error(
                    rule.name(),
                    format!("'{}' has no lookup table", target),
                );
            }
            if !assignable(Signature::single(BaseType::Float), shape) {
                self.error(rule.name(), "lookup source must be a single number");
            }
            return;
        }
        if !assignable(declaration.signature(), shape) {
            self.error(
                rule.name(),
                format!(
                    "value does not fit '{}' declared {}",
                    target,
                    declaration.signature()
                ),
            );
        }
    }

    fn declarations(&mut self, declarations: &[VariableDeclaration]) {
        let mut seen = BTreeSet::new();
        for declaration in declarations {
            let name = declaration.identifier.as_str();
            if !seen.insert(name) {
                self.error(name, "declared more than once");
            }
            if builtin_signature(name).is_some() {
                self.error(name, "clashes with a built-in variable");
            }
            let signature = declaration.signature();
            if !signature.is_legal() {
                self.error(name, format!("illegal signature {}", signature));
            }
            if let Some(default) = &declaration.default_value {
                if !default.fits(signature) && default.coerce_to(signature).is_none() {
                    self.error(name, format!("default does not fit {}", signature));
                }
            }
            if let Some(correct) = declaration.correct_response() {
                if declaration.kind != VariableKind::Response {
                    self.error(name, "only response variables have a correct response");
                } else if correct.coerce_to(signature).is_none() {
                    self.error(name, format!("correct response does not fit {}", signature));
                }
            }
        }
    }
}

fn numeric_result(children: &[Shape]) -> Shape {
    let base_type = if children
        .iter()
        .any(|s| s.base_type == Some(BaseType::Float))
    {
        Some(BaseType::Float)
    } else if children
        .iter()
        .all(|s| s.base_type == Some(BaseType::Integer))
    {
        Some(BaseType::Integer)
    } else {
        None
    };
    Shape {
        cardinality: Some(Cardinality::Single),
        base_type,
    }
}

// ──────────────────────────────────────────────
// Entry points
// ──────────────────────────────────────────────

/// Checks declarations, interactions and every rule list of `item`.
pub fn validate_item(item: &AssessmentItem, extensions: &ExtensionRegistry) -> ValidationReport {
    let mut report = ValidationReport::new();
    let env = ItemEnv { item };
    let subject = format!("item '{}'", item.identifier);
    {
        let mut checker = Checker::new(&env, extensions, &mut report, subject.clone());
        checker.declarations(&item.declarations);
    }
    for interaction in &item.interactions {
        let name = interaction.response_identifier.as_str();
        match item.declaration(name) {
            Some(d) if d.kind == VariableKind::Response => {
                if interaction.is_end_attempt()
                    && d.signature() != Signature::single(BaseType::Boolean)
                {
                    report.error(
                        format!("{} > {}", subject, name),
                        "end-attempt responses must be single boolean",
                    );
                }
            }
            _ => report.error(
                format!("{} > {}", subject, name),
                "interaction is bound to an undeclared response variable",
            ),
        }
        if let Some(mask) = &interaction.pattern_mask {
            if let Err(e) = anchored_regex(mask) {
                report.error(format!("{} > {}", subject, name), e.to_string());
            }
        }
    }
    {
        let mut checker = Checker::new(
            &env,
            extensions,
            &mut report,
            format!("{} templateProcessing", subject),
        );
        checker.rules(&item.template_processing, ProcessingPhase::Template);
    }
    {
        let mut checker = Checker::new(
            &env,
            extensions,
            &mut report,
            format!("{} responseProcessing", subject),
        );
        checker.rules(&item.response_processing, ProcessingPhase::Response);
    }
    report
}

/// Pre-order position of every part, section and itemRef identifier.
fn document_order(test: &AssessmentTest, report: &mut ValidationReport) -> BTreeMap<Identifier, usize> {
    fn visit(
        section: &AssessmentSection,
        order: &mut BTreeMap<Identifier, usize>,
        report: &mut ValidationReport,
    ) {
        push(&section.identifier, order, report);
        for child in &section.children {
            match child {
                SectionPart::Section(s) => visit(s, order, report),
                SectionPart::ItemRef(r) => push(&r.identifier, order, report),
            }
        }
    }
    fn push(
        id: &Identifier,
        order: &mut BTreeMap<Identifier, usize>,
        report: &mut ValidationReport,
    ) {
        let next = order.len();
        if order.insert(id.clone(), next).is_some() {
            report.error(id.as_str(), "identifier is used more than once in the test");
        }
    }

    let mut order = BTreeMap::new();
    for part in &test.test_parts {
        push(&part.identifier, &mut order, report);
        for section in &part.sections {
            visit(section, &mut order, report);
        }
    }
    order
}

fn check_branch_rules(
    checker: &mut Checker<'_>,
    owner: &Identifier,
    rules: &[BranchRule],
    order: &BTreeMap<Identifier, usize>,
    part_ids: &BTreeSet<&Identifier>,
    is_part: bool,
) {
    for rule in rules {
        let shape = checker.expression(&rule.expression);
        if !assignable(Signature::single(BaseType::Boolean), shape) {
            checker.error("branchRule", "condition must be a single boolean");
        }
        match &rule.target {
            BranchTarget::Node(target) => {
                let here = order.get(owner).copied().unwrap_or(0);
                match order.get(target) {
                    None => checker.error(
                        "branchRule",
                        format!("target '{}' does not exist", target),
                    ),
                    Some(&there) if there <= here => checker.error(
                        "branchRule",
                        format!("target '{}' is not after '{}'", target, owner),
                    ),
                    Some(_) if is_part && !part_ids.contains(target) => checker.error(
                        "branchRule",
                        format!("test part branches must target a test part, not '{}'", target),
                    ),
                    Some(_) => {}
                }
            }
            BranchTarget::ExitSection if is_part => {
                checker.error("branchRule", "EXIT_SECTION is not valid on a test part")
            }
            _ => {}
        }
    }
}

fn validate_test(
    test: &AssessmentTest,
    items: &BTreeMap<Identifier, Arc<AssessmentItem>>,
    extensions: &ExtensionRegistry,
    report: &mut ValidationReport,
) {
    let order = document_order(test, report);
    let part_ids: BTreeSet<&Identifier> = test.test_parts.iter().map(|p| &p.identifier).collect();
    let env = TestEnv { test, items };
    let subject = format!("test '{}'", test.identifier);
    let mut checker = Checker::new(&env, extensions, report, subject.clone());
    checker.declarations(&test.declarations);
    for declaration in &test.declarations {
        if declaration.kind != VariableKind::Outcome {
            checker.error(
                declaration.identifier.as_str(),
                "tests may only declare outcome variables",
            );
        }
    }

    for part in &test.test_parts {
        checker.subject = format!("{} > testPart '{}'", subject, part.identifier);
        for precondition in &part.preconditions {
            let shape = checker.expression(precondition);
            if !assignable(Signature::single(BaseType::Boolean), shape) {
                checker.error("preCondition", "condition must be a single boolean");
            }
        }
        check_branch_rules(
            &mut checker,
            &part.identifier,
            &part.branch_rules,
            &order,
            &part_ids,
            true,
        );
        for section in &part.sections {
            check_section(&mut checker, section, &order, &part_ids, items);
        }
    }

    checker.subject = format!("{} outcomeProcessing", subject);
    checker.rules(&test.outcome_processing, ProcessingPhase::Outcome);
}

fn check_section(
    checker: &mut Checker<'_>,
    section: &AssessmentSection,
    order: &BTreeMap<Identifier, usize>,
    part_ids: &BTreeSet<&Identifier>,
    items: &BTreeMap<Identifier, Arc<AssessmentItem>>,
) {
    let saved = checker.subject.clone();
    checker.subject = format!("{} > section '{}'", saved, section.identifier);
    for precondition in &section.preconditions {
        let shape = checker.expression(precondition);
        if !assignable(Signature::single(BaseType::Boolean), shape) {
            checker.error("preCondition", "condition must be a single boolean");
        }
    }
    check_branch_rules(
        checker,
        &section.identifier,
        &section.branch_rules,
        order,
        part_ids,
        false,
    );
    if let Some(selection) = section.selection {
        if !selection.with_replacement && selection.select > section.children.len() {
            checker.error(
                "selection",
                format!(
                    "cannot select {} of {} children without replacement",
                    selection.select,
                    section.children.len()
                ),
            );
        }
    }
    for child in &section.children {
        match child {
            SectionPart::Section(s) => check_section(checker, s, order, part_ids, items),
            SectionPart::ItemRef(item_ref) => {
                check_item_ref(checker, item_ref, order, part_ids, items)
            }
        }
    }
    checker.subject = saved;
}

fn check_item_ref(
    checker: &mut Checker<'_>,
    item_ref: &AssessmentItemRef,
    order: &BTreeMap<Identifier, usize>,
    part_ids: &BTreeSet<&Identifier>,
    items: &BTreeMap<Identifier, Arc<AssessmentItem>>,
) {
    let saved = checker.subject.clone();
    checker.subject = format!("{} > itemRef '{}'", saved, item_ref.identifier);
    for precondition in &item_ref.preconditions {
        let shape = checker.expression(precondition);
        if !assignable(Signature::single(BaseType::Boolean), shape) {
            checker.error("preCondition", "condition must be a single boolean");
        }
    }
    check_branch_rules(
        checker,
        &item_ref.identifier,
        &item_ref.branch_rules,
        order,
        part_ids,
        false,
    );
    for template_default in &item_ref.template_defaults {
        let shape = checker.expression(&template_default.expression);
        let declaration = items
            .get(&item_ref.identifier)
            .and_then(|item| item.declaration(template_default.template_identifier.as_str()));
        match declaration {
            Some(d) if d.kind == VariableKind::Template => {
                if !assignable(d.signature(), shape) {
                    checker.error(
                        "templateDefault",
                        format!(
                            "value does not fit '{}' declared {}",
                            d.identifier,
                            d.signature()
                        ),
                    );
                }
            }
            Some(_) | None if items.contains_key(&item_ref.identifier) => checker.error(
                "templateDefault",
                format!(
                    "'{}' is not a template variable of the item",
                    template_default.template_identifier
                ),
            ),
            _ => {}
        }
    }
    checker.subject = saved;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: serde_json::Value) -> AssessmentItem {
        serde_json::from_value(value).unwrap()
    }

    fn choice_item() -> AssessmentItem {
        item(json!({
            "identifier": "Q1",
            "declarations": [
                {"identifier": "RESPONSE", "kind": "response", "cardinality": "single",
                 "baseType": "identifier",
                 "response": {"correctResponse": {"single": {"identifier": "ChoiceA"}}}},
                {"identifier": "SCORE", "kind": "outcome", "cardinality": "single",
                 "baseType": "float", "defaultValue": {"single": {"float": 0.0}}}
            ],
            "interactions": [
                {"responseIdentifier": "RESPONSE", "kind": "choice", "maxChoices": 1,
                 "choices": [{"identifier": "ChoiceA"}, {"identifier": "ChoiceB"}]}
            ],
            "responseProcessing": [
                {"condition": {"branches": [{
                    "guard": {"match": [
                        {"variable": {"identifier": "RESPONSE"}},
                        {"correct": {"identifier": "RESPONSE"}}
                    ]},
                    "rules": [{"setValue": {"identifier": "SCORE",
                        "expression": {"baseValue": {"integer": 1}}}}]
                }]}}
            ]
        }))
    }

    fn errors(report: &ValidationReport) -> Vec<String> {
        report.errors().map(|n| n.to_string()).collect()
    }

    #[test]
    fn well_formed_item_has_no_findings() {
        let report = validate_item(&choice_item(), &ExtensionRegistry::new());
        assert!(report.is_empty(), "{:?}", report);
    }

    #[test]
    fn type_mismatches_and_unresolved_references_are_errors() {
        let mut item = choice_item();
        item.response_processing = serde_json::from_value(json!([
            {"setValue": {"identifier": "SCORE", "expression": {"sum": [
                {"variable": {"identifier": "RESPONSE"}},
                {"baseValue": {"integer": 1}}
            ]}}},
            {"setValue": {"identifier": "SCORE",
                "expression": {"variable": {"identifier": "NOPE"}}}},
            {"setValue": {"identifier": "RESPONSE",
                "expression": {"baseValue": {"identifier": "ChoiceB"}}}},
            {"exitEarly": "exitTest"}
        ]))
        .unwrap();
        let report = validate_item(&item, &ExtensionRegistry::new());
        let errors = errors(&report);
        assert_eq!(errors.len(), 4, "{:#?}", errors);
        assert!(errors[0].contains("base type identifier"));
        assert!(errors[1].contains("'NOPE' is not declared"));
        assert!(errors[2].contains("not writable in response processing"));
        assert!(errors[3].contains("not allowed in response processing"));
    }

    #[test]
    fn mixed_container_types_are_only_warnings() {
        let mut item = choice_item();
        item.declarations.push(
            serde_json::from_value(json!({"identifier": "BAG", "kind": "outcome",
                "cardinality": "multiple", "baseType": "integer"}))
            .unwrap(),
        );
        item.response_processing = serde_json::from_value(json!([
            {"setValue": {"identifier": "BAG", "expression": {"multiple": [
                {"baseValue": {"integer": 1}}, {"baseValue": {"float": 2.0}}
            ]}}}
        ]))
        .unwrap();
        let report = validate_item(&item, &ExtensionRegistry::new());
        assert!(report
            .warnings()
            .any(|w| w.message.contains("mixes base types")));
        assert!(!report.has_errors(), "{:?}", report);
    }

    #[test]
    fn declarations_are_checked() {
        let item = item(json!({
            "identifier": "Q",
            "declarations": [
                {"identifier": "X", "kind": "outcome", "cardinality": "single"},
                {"identifier": "Y", "kind": "outcome", "cardinality": "single",
                 "baseType": "integer", "defaultValue": {"single": {"string": "a"}}},
                {"identifier": "Y", "kind": "outcome", "cardinality": "single",
                 "baseType": "integer"},
                {"identifier": "duration", "kind": "outcome", "cardinality": "single",
                 "baseType": "float"}
            ]
        }));
        let errors = errors(&validate_item(&item, &ExtensionRegistry::new()));
        assert!(errors.iter().any(|e| e.contains("illegal signature")));
        assert!(errors.iter().any(|e| e.contains("default does not fit")));
        assert!(errors.iter().any(|e| e.contains("declared more than once")));
        assert!(errors.iter().any(|e| e.contains("built-in")));
    }

    #[test]
    fn test_only_nodes_and_unknown_extensions_fail_in_items() {
        let mut item = choice_item();
        item.response_processing = serde_json::from_value(json!([
            {"setValue": {"identifier": "SCORE", "expression": {"integerToFloat": {"numberCorrect": {}}}}},
            {"setValue": {"identifier": "SCORE", "expression": {"customOperator": {"class": "x.Y"}}}}
        ]))
        .unwrap();
        let errors = errors(&validate_item(&item, &ExtensionRegistry::new()));
        assert!(errors.iter().any(|e| e.contains("only available in test")));
        assert!(errors.iter().any(|e| e.contains("no custom operator registered")));
    }

    fn test_with(branch_target: &str) -> AssessmentTest {
        serde_json::from_value(json!({
            "identifier": "T",
            "declarations": [
                {"identifier": "TOTAL", "kind": "outcome", "cardinality": "single",
                 "baseType": "float"}
            ],
            "testParts": [{
                "identifier": "P1",
                "sections": [{
                    "identifier": "S1",
                    "children": [
                        {"itemRef": {"identifier": "A", "href": "a.xml",
                            "branchRules": [{"target": branch_target,
                                "expression": {"baseValue": {"boolean": true}}}]}},
                        {"itemRef": {"identifier": "B", "href": "b.xml"}}
                    ]
                }]
            }],
            "outcomeProcessing": [
                {"setValue": {"identifier": "TOTAL", "expression": {"sum": [
                    {"variable": {"identifier": "A.SCORE"}},
                    {"variable": {"identifier": "B.SCORE"}}
                ]}}}
            ]
        }))
        .unwrap()
    }

    fn resolver() -> BTreeMap<String, AssessmentItem> {
        let mut map = BTreeMap::new();
        map.insert("a.xml".to_string(), choice_item());
        map
    }

    #[test]
    fn unresolved_items_are_reported_with_their_href() {
        let resolved = ResolvedTest::resolve(
            test_with("EXIT_SECTION"),
            &resolver(),
            &ExtensionRegistry::new(),
        );
        let errors = errors(resolved.report());
        assert!(errors.iter().any(|e| e.contains("cannot resolve 'b.xml'")));
        assert!(errors.iter().any(|e| e.contains("unknown itemRef 'B'")));
        assert!(matches!(
            resolved.ensure_valid(),
            Err(EngineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn branch_targets_must_exist_and_point_forward() {
        let mut items = resolver();
        items.insert("b.xml".to_string(), choice_item());
        let ok = ResolvedTest::resolve(test_with("B"), &items, &ExtensionRegistry::new());
        assert!(ok.ensure_valid().is_ok(), "{:?}", ok.report());

        let back = ResolvedTest::resolve(test_with("S1"), &items, &ExtensionRegistry::new());
        assert!(errors(back.report())
            .iter()
            .any(|e| e.contains("is not after")));

        let missing = ResolvedTest::resolve(test_with("Z"), &items, &ExtensionRegistry::new());
        assert!(errors(missing.report())
            .iter()
            .any(|e| e.contains("does not exist")));
    }
}
