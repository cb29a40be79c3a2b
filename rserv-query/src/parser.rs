use crate::ast::*;
use crate::error::Error;
use crate::lexer::{Lexer, Token, TokenType};

pub struct Parser<'a> {
    _phantom: std::marker::PhantomData<&'a ()>,
}

impl<'a> Parser<'a> {
    pub fn parse(input: &'a str) -> Result<Query, Error> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = TokenParser::new(tokens);
        parser.parse_query()
    }
}

struct TokenParser {
    tokens: Vec<Token>,
    position: usize,
}

impl TokenParser {
    // Pratt parser binding powers (higher = tighter binding).
    const BP_OR: u8 = 10;
    const BP_AND: u8 = 20;
    const BP_NOT: u8 = 30;
    const BP_CMP: u8 = 40;

    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn parse_query(&mut self) -> Result<Query, Error> {
        let traversal = if self.match_token(&TokenType::Bfs) {
            Traversal::Bfs
        } else if self.match_token(&TokenType::Dfs) {
            Traversal::Dfs
        } else {
            Traversal::Bfs
        };

        let mut matches = Vec::new();
        while self.match_token(&TokenType::Match) {
            let pattern = self.parse_pattern()?;
            let where_clause = if self.match_token(&TokenType::Where) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            matches.push(MatchClause {
                pattern,
                where_clause,
            });
        }
        if matches.is_empty() {
            return Err(self.error_here("expected MATCH"));
        }

        let with = if self.match_token(&TokenType::With) {
            Some(self.parse_projection()?)
        } else {
            None
        };

        self.consume(&TokenType::Return, "expected RETURN")?;
        let ret = self.parse_projection()?;

        let order_by = if self.match_token(&TokenType::Order) {
            self.consume(&TokenType::By, "expected BY after ORDER")?;
            Some(self.parse_order_by()?)
        } else {
            None
        };

        let limit = if self.match_token(&TokenType::Limit) {
            Some(self.parse_integer("LIMIT")?)
        } else {
            None
        };

        if !self.is_at_end() {
            return Err(self.error_here("unexpected trailing input"));
        }

        Ok(Query {
            traversal,
            matches,
            with,
            ret,
            order_by,
            limit,
        })
    }

    fn parse_pattern(&mut self) -> Result<Pattern, Error> {
        let mut elements = Vec::new();
        elements.push(PathElement::Node(self.parse_node_pattern()?));
        while self.check(&TokenType::Dash) {
            elements.push(PathElement::Edge(self.parse_edge_pattern()?));
            elements.push(PathElement::Node(self.parse_node_pattern()?));
        }
        Ok(Pattern { elements })
    }

    fn parse_node_pattern(&mut self) -> Result<NodePattern, Error> {
        self.consume(&TokenType::LeftParen, "expected '('")?;
        let variable = if self.peek_is_identifier() {
            Some(self.parse_identifier("node variable")?)
        } else {
            None
        };
        let label = if self.match_token(&TokenType::Colon) {
            Some(self.parse_identifier("node type")?)
        } else {
            None
        };
        let properties = if self.check(&TokenType::LeftBrace) {
            self.parse_property_map()?
        } else {
            Vec::new()
        };
        self.consume(&TokenType::RightParen, "expected ')'")?;
        Ok(NodePattern {
            variable,
            label,
            properties,
        })
    }

    fn parse_edge_pattern(&mut self) -> Result<EdgePattern, Error> {
        self.consume(&TokenType::Dash, "expected '-'")?;
        self.consume(&TokenType::LeftBracket, "expected '['")?;

        let mut variable = None;
        let mut labels = Vec::new();
        let mut range = None;
        let mut properties = Vec::new();

        if self.peek_is_identifier() {
            variable = Some(self.parse_identifier("edge variable")?);
        }
        if self.match_token(&TokenType::Colon) {
            loop {
                labels.push(self.parse_identifier("edge label")?);
                if !self.match_token(&TokenType::Pipe) {
                    break;
                }
            }
        }
        if self.match_token(&TokenType::Asterisk) {
            range = Some(self.parse_length_range()?);
        }
        if self.check(&TokenType::LeftBrace) {
            properties = self.parse_property_map()?;
        }

        self.consume(&TokenType::RightBracket, "expected ']'")?;
        self.consume(&TokenType::RightArrow, "expected '->'")?;
        Ok(EdgePattern {
            variable,
            labels,
            range,
            properties,
        })
    }

    fn parse_length_range(&mut self) -> Result<LengthRange, Error> {
        let mut min = None;
        let mut max = None;
        if matches!(self.peek().token_type, TokenType::Number(_)) {
            let n = self.parse_integer("path length")?;
            min = Some(n);
            if self.match_token(&TokenType::RangeDots) {
                if matches!(self.peek().token_type, TokenType::Number(_)) {
                    max = Some(self.parse_integer("path length")?);
                }
            } else {
                max = Some(n);
            }
            return Ok(LengthRange { min, max });
        }
        if self.match_token(&TokenType::RangeDots) {
            if matches!(self.peek().token_type, TokenType::Number(_)) {
                max = Some(self.parse_integer("path length")?);
            }
        }
        Ok(LengthRange { min, max })
    }

    fn parse_property_map(&mut self) -> Result<Vec<PropertyPair>, Error> {
        self.consume(&TokenType::LeftBrace, "expected '{'")?;
        let mut properties = Vec::new();
        while !self.check(&TokenType::RightBrace) {
            let key = self.parse_identifier("property key")?;
            self.consume(&TokenType::Colon, "expected ':' in property map")?;
            let value = self.parse_literal()?;
            properties.push(PropertyPair { key, value });
            if !self.match_token(&TokenType::Comma) {
                break;
            }
        }
        self.consume(&TokenType::RightBrace, "expected '}'")?;
        Ok(properties)
    }

    fn parse_literal(&mut self) -> Result<Literal, Error> {
        let negate = self.match_token(&TokenType::Dash);
        let token = self.advance().clone();
        let literal = match token.token_type {
            TokenType::String(s) if !negate => Literal::String(s),
            TokenType::Number(n) => Literal::Number(if negate { -n } else { n }),
            TokenType::Boolean(b) if !negate => Literal::Boolean(b),
            TokenType::Null if !negate => Literal::Null,
            other => {
                return Err(Error::syntax(
                    "expected a literal",
                    other.lexeme(),
                    token.line,
                    token.column,
                ));
            }
        };
        Ok(literal)
    }

    fn parse_projection(&mut self) -> Result<Projection, Error> {
        let mut items = Vec::new();
        loop {
            let expression = self.parse_expression()?;
            let alias = if self.match_identifier_keyword("AS") {
                Some(self.parse_identifier("alias")?)
            } else {
                None
            };
            items.push(ProjectionItem { expression, alias });
            if !self.match_token(&TokenType::Comma) {
                break;
            }
        }
        Ok(Projection { items })
    }

    fn parse_order_by(&mut self) -> Result<OrderByClause, Error> {
        let mut items = Vec::new();
        loop {
            let expression = self.parse_expression()?;
            let direction = if self.match_token(&TokenType::Asc) {
                SortDirection::Ascending
            } else if self.match_token(&TokenType::Desc) {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            items.push(OrderByItem {
                expression,
                direction,
            });
            if !self.match_token(&TokenType::Comma) {
                break;
            }
        }
        Ok(OrderByClause { items })
    }

    fn parse_expression(&mut self) -> Result<Expression, Error> {
        self.parse_expression_bp(0)
    }

    fn parse_expression_bp(&mut self, min_bp: u8) -> Result<Expression, Error> {
        let mut lhs = self.parse_prefix_expression()?;

        loop {
            let Some((op, lbp)) = self.peek_infix_operator() else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_expression_bp(lbp + 1)?;
            lhs = Expression::Binary(Box::new(BinaryExpression {
                left: lhs,
                operator: op,
                right: rhs,
            }));
        }

        Ok(lhs)
    }

    fn peek_infix_operator(&self) -> Option<(BinaryOperator, u8)> {
        let op = match self.peek().token_type {
            TokenType::Or => (BinaryOperator::Or, Self::BP_OR),
            TokenType::And => (BinaryOperator::And, Self::BP_AND),
            TokenType::Equals => (BinaryOperator::Equals, Self::BP_CMP),
            TokenType::NotEquals => (BinaryOperator::NotEquals, Self::BP_CMP),
            TokenType::LessThan => (BinaryOperator::LessThan, Self::BP_CMP),
            TokenType::LessEqual => (BinaryOperator::LessEqual, Self::BP_CMP),
            TokenType::GreaterThan => (BinaryOperator::GreaterThan, Self::BP_CMP),
            TokenType::GreaterEqual => (BinaryOperator::GreaterEqual, Self::BP_CMP),
            _ => return None,
        };
        Some(op)
    }

    fn parse_prefix_expression(&mut self) -> Result<Expression, Error> {
        if self.match_token(&TokenType::Not) {
            let operand = self.parse_expression_bp(Self::BP_NOT)?;
            return Ok(Expression::Unary(Box::new(UnaryExpression {
                operator: UnaryOperator::Not,
                operand,
            })));
        }
        if self.match_token(&TokenType::Dash) {
            let operand = self.parse_expression_bp(Self::BP_NOT)?;
            return Ok(Expression::Unary(Box::new(UnaryExpression {
                operator: UnaryOperator::Negate,
                operand,
            })));
        }
        self.parse_primary_expression()
    }

    fn parse_primary_expression(&mut self) -> Result<Expression, Error> {
        let token = self.peek().clone();
        match &token.token_type {
            TokenType::LeftParen => {
                // `(x)-[:L]->()` in expression position is an existence
                // test; a lone parenthesised expression backtracks.
                let start = self.position;
                if let Ok(pattern) = self.parse_pattern() {
                    if pattern.elements.len() > 1 {
                        return Ok(Expression::PatternExists(pattern));
                    }
                }
                self.position = start;
                self.advance();
                let expr = self.parse_expression_bp(0)?;
                self.consume(&TokenType::RightParen, "expected ')'")?;
                Ok(expr)
            }
            TokenType::String(s) => {
                let s = s.clone();
                self.advance();
                Ok(Expression::Literal(Literal::String(s)))
            }
            TokenType::Number(n) => {
                let n = *n;
                self.advance();
                Ok(Expression::Literal(Literal::Number(n)))
            }
            TokenType::Boolean(b) => {
                let b = *b;
                self.advance();
                Ok(Expression::Literal(Literal::Boolean(b)))
            }
            TokenType::Null => {
                self.advance();
                Ok(Expression::Literal(Literal::Null))
            }
            TokenType::Exists => {
                self.advance();
                self.consume(&TokenType::LeftParen, "expected '(' after EXISTS")?;
                let arg = self.parse_expression_bp(0)?;
                self.consume(&TokenType::RightParen, "expected ')'")?;
                Ok(Expression::FunctionCall(FunctionCall {
                    name: "EXISTS".to_string(),
                    args: vec![arg],
                }))
            }
            TokenType::Distinct => {
                // DISTINCT(x) is the distinct-collect aggregate.
                self.advance();
                self.consume(&TokenType::LeftParen, "expected '(' after DISTINCT")?;
                let arg = self.parse_expression_bp(0)?;
                self.consume(&TokenType::RightParen, "expected ')'")?;
                Ok(Expression::FunctionCall(FunctionCall {
                    name: "DISTINCT".to_string(),
                    args: vec![arg],
                }))
            }
            TokenType::Identifier(name) => {
                let name = name.clone();
                self.advance();
                if self.match_token(&TokenType::Dot) {
                    let property = self.parse_identifier("property name")?;
                    return Ok(Expression::Property(PropertyAccess {
                        variable: name,
                        property,
                    }));
                }
                if self.match_token(&TokenType::LeftParen) {
                    let mut args = Vec::new();
                    if self.match_token(&TokenType::Asterisk) {
                        // COUNT(*)
                    } else if !self.check(&TokenType::RightParen) {
                        loop {
                            args.push(self.parse_expression_bp(0)?);
                            if !self.match_token(&TokenType::Comma) {
                                break;
                            }
                        }
                    }
                    self.consume(&TokenType::RightParen, "expected ')'")?;
                    return Ok(Expression::FunctionCall(FunctionCall { name, args }));
                }
                Ok(Expression::Variable(name))
            }
            other => Err(Error::syntax(
                "expected an expression",
                other.lexeme(),
                token.line,
                token.column,
            )),
        }
    }

    fn parse_integer(&mut self, ctx: &str) -> Result<u32, Error> {
        let token = self.advance().clone();
        match token.token_type {
            TokenType::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u32),
            other => Err(Error::syntax(
                format!("expected a non-negative integer after {ctx}"),
                other.lexeme(),
                token.line,
                token.column,
            )),
        }
    }

    fn parse_identifier(&mut self, ctx: &str) -> Result<String, Error> {
        let token = self.advance().clone();
        match token.token_type {
            TokenType::Identifier(name) => Ok(name),
            other => Err(Error::syntax(
                format!("expected an identifier for {ctx}"),
                other.lexeme(),
                token.line,
                token.column,
            )),
        }
    }

    /// Contextual keyword spelled as an identifier (currently only `AS`).
    fn match_identifier_keyword(&mut self, word: &str) -> bool {
        if let TokenType::Identifier(name) = &self.peek().token_type {
            if name.eq_ignore_ascii_case(word) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn peek_is_identifier(&self) -> bool {
        matches!(self.peek().token_type, TokenType::Identifier(_))
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.position.min(self.tokens.len() - 1)];
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn check(&self, token_type: &TokenType) -> bool {
        &self.peek().token_type == token_type
    }

    fn match_token(&mut self, token_type: &TokenType) -> bool {
        if self.check(token_type) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, token_type: &TokenType, message: &str) -> Result<(), Error> {
        if self.match_token(token_type) {
            Ok(())
        } else {
            Err(self.error_here(message))
        }
    }

    fn error_here(&self, message: &str) -> Error {
        let token = self.peek();
        Error::syntax(
            message,
            token.token_type.lexeme(),
            token.line,
            token.column,
        )
    }

    fn is_at_end(&self) -> bool {
        self.check(&TokenType::Eof)
    }
}
